//! Transfer mode selection.

use drover_events::TransferMode;

use crate::network::NetworkResolver;

/// Picks the transfer mode for a pair of endpoints.
///
/// A preferred pull or push is kept when its initiator can reach the other
/// side. Otherwise pull wins over push. Relay is only ever chosen when neither
/// side can open a connection to the other, even when it is preferred.
pub fn choose_mode(
    preferred: Option<TransferMode>,
    target_reaches_source: bool,
    source_reaches_target: bool,
) -> TransferMode {
    match preferred {
        Some(TransferMode::Pull) if target_reaches_source => return TransferMode::Pull,
        Some(TransferMode::Push) if source_reaches_target => return TransferMode::Push,
        _ => {}
    }

    if target_reaches_source {
        TransferMode::Pull
    } else if source_reaches_target {
        TransferMode::Push
    } else {
        TransferMode::Relay
    }
}

/// Probes reachability in both directions and picks a mode.
pub async fn select_mode(
    network: &dyn NetworkResolver,
    source_address: &str,
    target_address: &str,
    preferred: Option<TransferMode>,
) -> TransferMode {
    let target_reaches_source = network.reachable(target_address, source_address).await;
    let source_reaches_target = network.reachable(source_address, target_address).await;
    choose_mode(preferred, target_reaches_source, source_reaches_target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::StaticNetwork;
    use rstest::rstest;

    #[rstest]
    #[case(None, true, true, TransferMode::Pull)]
    #[case(None, false, true, TransferMode::Push)]
    #[case(None, false, false, TransferMode::Relay)]
    #[case(Some(TransferMode::Push), true, true, TransferMode::Push)]
    #[case(Some(TransferMode::Push), true, false, TransferMode::Pull)]
    #[case(Some(TransferMode::Pull), false, true, TransferMode::Push)]
    #[case(Some(TransferMode::Relay), true, true, TransferMode::Pull)]
    #[case(Some(TransferMode::Relay), false, true, TransferMode::Push)]
    #[case(Some(TransferMode::Relay), false, false, TransferMode::Relay)]
    fn test_choose_mode(
        #[case] preferred: Option<TransferMode>,
        #[case] target_reaches_source: bool,
        #[case] source_reaches_target: bool,
        #[case] expected: TransferMode,
    ) {
        assert_eq!(
            choose_mode(preferred, target_reaches_source, source_reaches_target),
            expected
        );
    }

    #[tokio::test]
    async fn test_select_mode_with_partition() {
        let net = StaticNetwork::new();
        net.block("10.0.0.2:8443", "10.0.0.1:8443");
        assert_eq!(
            select_mode(&net, "10.0.0.1:8443", "10.0.0.2:8443", None).await,
            TransferMode::Push
        );

        net.block("10.0.0.1:8443", "10.0.0.2:8443");
        assert_eq!(
            select_mode(&net, "10.0.0.1:8443", "10.0.0.2:8443", None).await,
            TransferMode::Relay
        );
    }
}
