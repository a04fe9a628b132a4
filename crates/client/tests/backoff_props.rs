use murmur_client::ws::{ReconnectConfig, ReconnectController};
use proptest::prelude::*;

proptest! {
    #[test]
    fn delays_never_shrink_and_stop_at_the_cap(base in 1u64..10_000, max_attempts in 1u32..40) {
        let config = ReconnectConfig { base_delay_ms: base, max_attempts };
        let mut controller = ReconnectController::new(config);
        controller.request_connect(true).unwrap();

        let mut previous = None;
        for _ in 0..max_attempts {
            let delay = controller.on_connection_lost("refused");
            prop_assert!(delay.is_some());
            prop_assert!(delay >= previous);
            previous = delay;
        }
        prop_assert_eq!(controller.on_connection_lost("refused"), None);
        prop_assert!(controller.state().is_errored());
    }
}
