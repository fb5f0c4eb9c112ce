use crate::context::RequestContext;
use crate::error::{GatewayError, Result};

/// Every present parameter with a rule must match it. Absent parameters and
/// parameters without a rule are not checked.
pub fn verify(ctx: &RequestContext) -> Result<()> {
    let rules = &ctx.api.param_rules;
    if rules.is_empty() {
        return Ok(());
    }

    for (name, value) in &ctx.params {
        if let Some(rule) = rules.get(name) {
            if !rule.is_match(value) {
                return Err(GatewayError::InvalidParam(format!(
                    "{} does not match {}",
                    name,
                    rule.as_str()
                )));
            }
        }
    }

    Ok(())
}
