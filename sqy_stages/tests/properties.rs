use proptest::prelude::*;
use sqy_core::SqyError;
use sqy_stages::api;

const LOSSLESS_WIDE: &[&str] = &[
    "pass_through",
    "lz4",
    "lz4(framestep_kb=1)",
    "zstd(level=1)",
    "diff->lz4",
    "bitswap1->lz4",
    "bitswap4->zstd(level=2)",
    "diff->bitswap2->lz4(framestep_kb=2)",
    "flatten_to_neighborhood->lz4",
];

const LOSSLESS_BYTES: &[&str] = &[
    "h264",
    "h264(gop=1)->lz4",
    "diff->h264(gop=3,level=1)",
    "hevc",
    "hevc(gop=2)->zstd",
    "bitswap8->zstd",
];

/// Shape of 1 to 3 small dimensions together with a matching buffer.
fn shaped<T: Arbitrary + Clone + 'static>() -> impl Strategy<Value = (Vec<usize>, Vec<T>)> {
    prop::collection::vec(1usize..24, 1..4).prop_flat_map(|shape| {
        let n: usize = shape.iter().product();
        (Just(shape), prop::collection::vec(any::<T>(), n))
    })
}

/// Names mixing valid stages with unknown tokens and bad arguments.
fn pipeline_names() -> impl Strategy<Value = String> {
    let segment = prop::sample::select(vec![
        "lz4",
        "zstd",
        "zstd(level=9)",
        "zstd(level=99)",
        "lz4(framestep_kb=64)",
        "lz4(speed=1)",
        "bitswap1",
        "bitswap3",
        "bitswap",
        "diff",
        "pass_through",
        "remove_background(threshold=5)",
        "quantiser",
        "h264(qp=12)",
        "hevc(qp=300)",
        "flatten_to_neighborhood(fraction=0.25)",
        "flatten_to_neighborhood(fraction=2)",
        "remove_estimated_background",
        "foo",
        "",
    ]);
    prop::collection::vec(segment, 1..4).prop_map(|segments| segments.join("->"))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_lossless_round_trip_u16(
        (shape, data) in shaped::<u16>(),
        name in prop::sample::select(LOSSLESS_WIDE),
        threads in 1usize..4,
    ) {
        let stream = api::encode_to_vec(name, &data, &shape, threads).unwrap();
        prop_assert_eq!(api::decode_to_vec::<u16>(&stream, threads).unwrap(), data);
        prop_assert_eq!(api::decompressed_shape(&stream).unwrap(), shape);
    }

    #[test]
    fn prop_lossless_round_trip_u8(
        (shape, data) in shaped::<u8>(),
        name in prop::sample::select([LOSSLESS_WIDE, LOSSLESS_BYTES].concat()),
    ) {
        let stream = api::encode_to_vec(name, &data, &shape, 2).unwrap();
        prop_assert_eq!(api::decode_to_vec::<u8>(&stream, 1).unwrap(), data);
    }

    #[test]
    fn prop_bound_is_sound(
        (shape, data) in shaped::<u8>(),
        name in prop::sample::select([LOSSLESS_WIDE, LOSSLESS_BYTES].concat()),
    ) {
        let bound = api::max_compressed_length(name, data.len()).unwrap();
        prop_assert!(bound >= data.len());
        let mut dst = vec![0u8; bound];
        let n = api::encode(name, &data, &shape, &mut dst, 1).unwrap();
        prop_assert!(n <= bound);
        prop_assert!(n <= api::max_compressed_length_for_shape::<u8>(name, &shape).unwrap());
    }

    #[test]
    fn prop_feasibility_matches_encode(name in pipeline_names(), data in prop::collection::vec(any::<u16>(), 1..64)) {
        let possible = api::pipeline_possible(&name);
        let invalid = matches!(
            api::encode_to_vec(&name, &data, &[data.len()], 1),
            Err(SqyError::InvalidPipelineName { .. })
        );
        prop_assert_eq!(possible, !invalid, "{}", name);
        prop_assert_eq!(possible, api::max_compressed_length(&name, data.len()).is_ok());
    }
}
