use crate::context::RequestContext;
use crate::error::{GatewayError, Result};
use crate::policy::{BwEntry, BwMode, MatchKind};

/// Black/white list check.
///
/// The first matching entry decides: a black list rejects it, a white list
/// lets it through and rejects everything unmatched.
pub fn check(ctx: &RequestContext) -> Result<()> {
    let Some(bw) = ctx.bw_strategy() else {
        return Ok(());
    };

    let matched = bw.entries.iter().find(|entry| matches(entry, ctx));

    match (bw.mode, matched) {
        (BwMode::Black, Some(entry)) => Err(GatewayError::Blocked(format!(
            "black list: {} {} is blocked",
            describe(entry),
            entry.val
        ))),
        (BwMode::Black, None) => Ok(()),
        (BwMode::White, Some(_)) => Ok(()),
        (BwMode::White, None) => Err(GatewayError::Blocked(format!(
            "white list: client {} is not allowed",
            ctx.client_ip
        ))),
    }
}

fn matches(entry: &BwEntry, ctx: &RequestContext) -> bool {
    match entry.kind {
        MatchKind::Ip => entry.val == ctx.client_ip,
        MatchKind::Param => ctx.param(&entry.key) == Some(entry.val.as_str()),
    }
}

fn describe(entry: &BwEntry) -> &str {
    match entry.kind {
        MatchKind::Ip => "ip",
        MatchKind::Param => &entry.key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::tests::{context, strategy_record};
    use crate::policy::StrategyType;

    const ENTRY: &str = r#"[{"type":"ip","key":"","val":"1.2.3.4"}]"#;

    #[test]
    fn test_black_list_ip() {
        let bw = strategy_record(1, StrategyType::BwList, 1, ENTRY);
        assert!(check(&context("1.2.3.4", &[], vec![bw.clone()])).is_err());
        assert!(check(&context("5.6.7.8", &[], vec![bw])).is_ok());
    }

    #[test]
    fn test_white_list_ip() {
        let bw = strategy_record(1, StrategyType::BwList, 2, ENTRY);
        assert!(check(&context("1.2.3.4", &[], vec![bw.clone()])).is_ok());
        assert!(check(&context("5.6.7.8", &[], vec![bw])).is_err());
    }

    #[test]
    fn test_black_list_param() {
        let bw = strategy_record(
            1,
            StrategyType::BwList,
            1,
            r#"[{"type":"param","key":"uid","val":"42"}]"#,
        );
        assert!(check(&context("1.1.1.1", &[("uid", "42")], vec![bw.clone()])).is_err());
        assert!(check(&context("1.1.1.1", &[("uid", "43")], vec![bw.clone()])).is_ok());
        assert!(check(&context("1.1.1.1", &[], vec![bw])).is_ok());
    }

    #[test]
    fn test_no_strategy_passes() {
        assert!(check(&context("1.2.3.4", &[], vec![])).is_ok());
    }
}
