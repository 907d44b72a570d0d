use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use filegate::config::LEGACY_BATCH_LIMIT;
use filegate::delivery::deep_link::LegacyLink;
use filegate::delivery::{decode_deep_link, StartPayload};
use filegate::storage::MemoryStorage;
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime")
}

proptest! {
    #[test]
    fn parse_never_panics(payload in "\\PC{0,64}") {
        let _ = StartPayload::parse(&payload);
    }

    #[test]
    fn decode_never_fails_on_memory_registry(payload in "[A-Za-z0-9_=+/-]{0,48}") {
        let registry = MemoryStorage::new();
        let link = runtime()
            .block_on(decode_deep_link(&payload, &registry, -1_001_234_567_890))
            .expect("memory registry does not fail");
        prop_assert!(link.relay_ids.len() <= LEGACY_BATCH_LIMIT);
    }

    #[test]
    fn legacy_ranges_stay_within_limit(
        first in 0_i64..i64::MAX,
        last in 0_i64..i64::MAX,
        channel in any::<i64>(),
    ) {
        let text = format!("get-{first}-{last}");
        let Some(link) = LegacyLink::parse(&text) else {
            return Err(TestCaseError::fail("well-formed legacy text"));
        };
        let ids = link.message_ids(channel);
        prop_assert!(ids.len() <= LEGACY_BATCH_LIMIT);
        if let (Some(a), Some(b)) = (ids.first(), ids.last()) {
            prop_assert_eq!(a.0.abs_diff(b.0) as usize + 1, ids.len());
        }
    }

    #[test]
    fn legacy_single_round_trips(id in 1_i32..i32::MAX, channel in 1_i64..1_000_000_000_000) {
        let encoded = i128::from(id) * i128::from(channel);
        let payload = URL_SAFE_NO_PAD.encode(format!("get-{encoded}"));
        match StartPayload::parse(&payload) {
            StartPayload::Legacy(link) => {
                prop_assert!(!link.is_batch());
                prop_assert_eq!(link.message_ids(-channel), vec![teloxide::types::MessageId(id)]);
            }
            other => prop_assert!(false, "unexpected payload {:?}", other),
        }
    }
}
