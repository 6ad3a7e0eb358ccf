use proptest::prelude::*;
use veredarii_transport::{read_delimited, write_delimited};

fn block_on<F: std::future::Future>(f: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
        .block_on(f)
}

proptest! {
    /// Any sequence of messages survives delimited framing in order.
    #[test]
    fn delimited_sequence_roundtrip(
        messages in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..3000), 0..8),
    ) {
        let decoded = block_on(async {
            let mut wire = Vec::new();
            for m in &messages {
                write_delimited(&mut wire, m).await.unwrap();
            }
            let mut reader = &wire[..];
            let mut out = Vec::new();
            while let Some(m) = read_delimited(&mut reader, 1 << 20).await.unwrap() {
                out.push(m);
            }
            out
        });
        prop_assert_eq!(decoded, messages);
    }

    /// Frames above the limit are refused without allocating the body.
    #[test]
    fn delimited_respects_limit(len in 65usize..4096) {
        let result = block_on(async {
            let mut wire = Vec::new();
            write_delimited(&mut wire, &vec![0u8; len]).await.unwrap();
            let mut reader = &wire[..];
            read_delimited(&mut reader, 64).await
        });
        prop_assert!(result.is_err());
    }
}
