use crate::context::RequestContext;
use rand::Rng;
use tracing::info;

/// Canary routing: may swap the request's API for its canary target.
/// Never fails the request.
pub fn route(ctx: &mut RequestContext) {
    let draw = rand::thread_rng().gen_range(0..=100);
    route_with_draw(ctx, draw);
}

/// Same as [`route`] with a given random draw in `[0, 100]`.
/// The draw is accepted on the closed interval `[0, ratio]`; a ratio of 0
/// disables random canary entirely, leaving only the IP allowlist.
pub fn route_with_draw(ctx: &mut RequestContext, draw: u32) {
    if !ctx.api.traffic_on || ctx.api.traffic_api.is_empty() {
        return;
    }

    let Some(target) = ctx.policies.api(&ctx.api.traffic_api).cloned() else {
        return;
    };

    if ctx.api.traffic_ips.contains(&ctx.client_ip) {
        if ctx.debug {
            info!(
                rid = ctx.rid,
                old_api = %ctx.api.api_id,
                new_api = %target.api_id,
                client_ip = %ctx.client_ip,
                "Canary by ip"
            );
        }
        ctx.api = target;
        return;
    }

    if ctx.api.traffic_ratio == 0 || draw > ctx.api.traffic_ratio {
        return;
    }

    if ctx.debug {
        info!(
            rid = ctx.rid,
            old_api = %ctx.api.api_id,
            new_api = %target.api_id,
            draw,
            ratio = ctx.api.traffic_ratio,
            "Canary by ratio"
        );
    }
    ctx.api = target;
}
