//! Property-Based Tests for the Harness
//!
//! Invariants checked over random inputs:
//!
//! - **Decoding**: arbitrary inbound lines never panic the decoder, and a
//!   payload carrying both `result` and `error` is always rejected
//! - **Correlation**: every response id equals the id of its request
//! - **Filenames**: traversal attempts are always flagged
//! - **Artifacts**: a zero-byte file always classifies as a defect
//! - **Retry**: backoff delays never exceed the configured cap
//!
//! # Running the Tests
//!
//! ```bash
//! cargo test --lib mcp::proptests
//! ```

use proptest::prelude::*;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

use crate::batch::{classify_download, PaperResult};
use crate::contract::tools::{filename_escapes_directory, parse_size_indicator};
use crate::mcp::client::ProtocolClient;
use crate::mcp::protocol::{DecodeError, InboundMessage};
use crate::mcp::retry::RetryConfig;
use crate::mcp::session::ToolOutcome;
use crate::mcp::testing::ScriptedTransport;

// Helper: Generate arbitrary JSON values
fn arb_json_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
        prop::collection::vec(any::<i64>().prop_map(|n| Value::Number(n.into())), 0..3)
            .prop_map(Value::Array),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ============================================================================
// Property 1: Inbound Decoding
// ============================================================================

proptest! {
    /// Arbitrary text never panics the decoder
    #[test]
    fn prop_decode_never_panics(line in ".*") {
        let _ = InboundMessage::decode(&line);
    }

    /// Arbitrary JSON objects never panic the decoder
    #[test]
    fn prop_decode_json_objects_never_panics(
        id in prop::option::of(arb_json_value()),
        method in prop::option::of("[a-z/]{1,20}"),
        result in prop::option::of(arb_json_value()),
    ) {
        let mut message = json!({"jsonrpc": "2.0"});
        if let Some(id) = id {
            message["id"] = id;
        }
        if let Some(method) = method {
            message["method"] = json!(method);
        }
        if let Some(result) = result {
            message["result"] = result;
        }
        let _ = InboundMessage::decode(&message.to_string());
    }

    /// result and error together are always a protocol violation
    #[test]
    fn prop_result_and_error_conflict(id in 1u64..10_000, result in arb_json_value()) {
        let line = json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
            "error": {"code": -32603, "message": "boom"}
        })
        .to_string();
        prop_assert_eq!(InboundMessage::decode(&line), Err(DecodeError::ResultErrorConflict));
    }
}

// ============================================================================
// Property 2: Request/Response Correlation
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Response id equals request id, and ids increase from 1
    #[test]
    fn prop_response_id_matches_request_id(calls in 1usize..20) {
        let rt = runtime();
        let ids = rt.block_on(async {
            let mut client = ProtocolClient::new(ScriptedTransport::echo_ids());
            let mut ids = Vec::new();
            for _ in 0..calls {
                let response = client
                    .call("tools/list", json!({}), Duration::from_secs(1))
                    .await
                    .unwrap()
                    .into_response()
                    .unwrap();
                ids.push(response.id);
            }
            ids
        });

        let expected: Vec<u64> = (1..=calls as u64).collect();
        prop_assert_eq!(ids, expected);
    }
}

// ============================================================================
// Property 3: Filename Traversal
// ============================================================================

proptest! {
    /// Any name with a `..` segment or a separator escapes the directory
    #[test]
    fn prop_traversal_always_flagged(
        prefix in "[a-zA-Z0-9_]{0,8}",
        suffix in "[a-zA-Z0-9_.]{0,8}",
        separator in prop_oneof![Just(".."), Just("/"), Just("\\"), Just("../")],
    ) {
        let name = format!("{}{}{}", prefix, separator, suffix);
        prop_assert!(filename_escapes_directory(&name));
    }

    /// Plain names are accepted
    #[test]
    fn prop_plain_names_accepted(stem in "[a-zA-Z0-9_][a-zA-Z0-9_ -]{0,30}") {
        let name = format!("{}.pdf", stem);
        prop_assert!(!filename_escapes_directory(&name));
    }
}

// ============================================================================
// Property 4: Artifacts
// ============================================================================

proptest! {
    /// A zero-byte file makes the download a defect whatever the server said
    #[test]
    fn prop_zero_byte_is_always_defect(
        sizes in prop::collection::vec(0u64..4096, 0..5),
        is_error in any::<bool>(),
        text in "[a-zA-Z ]{0,40}",
    ) {
        let mut written: Vec<(PathBuf, u64)> = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| (PathBuf::from(format!("/d/{}.pdf", i)), *size))
            .collect();
        written.push((PathBuf::from("/d/empty.pdf"), 0));

        let outcome = ToolOutcome {
            tool: "download_paper".to_string(),
            is_error,
            failure: None,
            text,
            content: Vec::new(),
            elapsed: Duration::ZERO,
        };
        let is_zero_byte_defect = matches!(
            classify_download(&outcome, &written),
            PaperResult::ZeroByteDefect { .. }
        );
        prop_assert!(is_zero_byte_defect);
    }

    /// Size indicators are read back in bytes
    #[test]
    fn prop_size_indicator_parsed(kb in 1u64..100_000) {
        let text = format!("✅ Download successful!\n\n📦 Size: {} KB\n✓ Status: Complete", kb);
        let size = parse_size_indicator(&text).unwrap();
        prop_assert_eq!(size.bytes(), kb * 1024);
    }
}

// ============================================================================
// Property 5: Retry Delays
// ============================================================================

proptest! {
    /// Retry delays never exceed max_delay
    #[test]
    fn prop_retry_delays_bounded_by_max(
        base_delay_ms in 10u64..1000,
        max_delay_ms in 1000u64..60000,
        attempt in 0usize..64usize
    ) {
        let config = RetryConfig::new()
            .base_delay(Duration::from_millis(base_delay_ms))
            .max_delay(Duration::from_millis(max_delay_ms));

        let delay = config.calculate_delay(attempt);
        prop_assert!(delay <= Duration::from_millis(max_delay_ms));
        prop_assert!(delay >= Duration::from_millis(base_delay_ms).min(Duration::from_millis(max_delay_ms)));
    }
}
