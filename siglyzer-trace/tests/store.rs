use proptest::prelude::*;
use siglyzer_trace::{BitVec, Trace};

type BlockInput = (usize, u64, Vec<bool>);

fn arb_blocks() -> impl Strategy<Value = Vec<BlockInput>> {
    prop::collection::vec(
        (1usize..8).prop_flat_map(|len| {
            (
                Just(len),
                1u64..6,
                prop::collection::vec(any::<bool>(), len),
            )
        }),
        0..12,
    )
}

fn arb_case() -> impl Strategy<Value = (Vec<BlockInput>, u64, u64)> {
    arb_blocks()
        .prop_flat_map(|blocks| {
            let len: u64 = blocks.iter().map(|(l, r, _)| *l as u64 * r).sum();
            (Just(blocks), 0..=len, 0..=len)
        })
        .prop_map(|(blocks, a, b)| if a <= b { (blocks, a, b) } else { (blocks, b, a) })
}

fn build(blocks: &[BlockInput]) -> (Trace, Vec<bool>) {
    let mut trace = Trace::new(1_000_000.0, 0);
    let mut flat = Vec::new();
    for (len, repeat, bits) in blocks {
        let payload: BitVec = bits.iter().copied().collect();
        trace.append_block(*len, *repeat, &payload);
        for _ in 0..*repeat {
            flat.extend(bits.iter().copied());
        }
    }
    (trace, flat)
}

proptest! {
    #[test]
    fn append_preserves_invariants(blocks in arb_blocks()) {
        let (trace, flat) = build(&blocks);

        prop_assert_eq!(trace.len(), flat.len() as u64);

        // Keys and payload offsets are contiguous and spans account for
        // every sample.
        let mut expected_key = 0u64;
        let mut expected_offset = 0usize;
        for (key, block) in &trace.blocks {
            prop_assert_eq!(*key, expected_key);
            prop_assert_eq!(block.data_offset, expected_offset);
            prop_assert!(block.block_length >= 1);
            prop_assert!(block.repeat_count >= 1);
            expected_key += block.span();
            expected_offset += block.block_length;
        }
        prop_assert_eq!(trace.data.len(), expected_offset);
    }

    #[test]
    fn samples_match_flat_expansion(blocks in arb_blocks()) {
        let (trace, flat) = build(&blocks);
        for (i, &bit) in flat.iter().enumerate() {
            prop_assert_eq!(trace.sample(i as u64), bit);
        }
    }

    #[test]
    fn multisample_matches_flat_expansion((blocks, first, last) in arb_case()) {
        let (trace, flat) = build(&blocks);
        let slice = &flat[first as usize..last as usize];
        let expected = (slice.iter().any(|&b| !b), slice.iter().any(|&b| b));
        prop_assert_eq!(trace.multisample(first, last), expected);
    }
}
