//! Property tests for the wire codec and the marshaller.

use proptest::prelude::*;

use trdp::frame::{
    self, FCS_SIZE, MsgType, PD_HEADER_SIZE, PROTOCOL_VERSION, PdHeader, pd_packet_size,
};
use trdp::marshall::{DataType, Dataset, DatasetElement, Registry, VAR_SIZE};

fn build_pd_frame(seq: u32, com_id: u32, etb: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; pd_packet_size(payload.len())];
    {
        let header = PdHeader::mut_from_frame(&mut frame).unwrap();
        header.sequence_counter.set(seq);
        header.protocol_version.set(PROTOCOL_VERSION);
        header.msg_type.set(MsgType::Pd as u16);
        header.com_id.set(com_id);
        header.etb_topo_cnt.set(etb);
        header.dataset_length.set(payload.len() as u32);
    }
    frame[PD_HEADER_SIZE..PD_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    frame::seal_pd(&mut frame);
    frame
}

fn scalar_registry() -> Registry {
    Registry::new(
        vec![(1, 1001)],
        vec![Dataset {
            id: 1001,
            elements: vec![
                DatasetElement {
                    type_id: DataType::UInt8 as u32,
                    count: 1,
                },
                DatasetElement {
                    type_id: DataType::UInt32 as u32,
                    count: 1,
                },
                DatasetElement {
                    type_id: DataType::UInt16 as u32,
                    count: 1,
                },
                DatasetElement {
                    type_id: DataType::Int64 as u32,
                    count: 1,
                },
            ],
        }],
    )
}

/// Host image of the scalar test dataset: u8 @0, u32 @4, u16 @8, i64 @16.
fn scalar_host(a: u8, b: u32, c: u16, d: i64) -> Vec<u8> {
    let mut host = vec![0u8; 24];
    host[0] = a;
    host[4..8].copy_from_slice(&b.to_ne_bytes());
    host[8..10].copy_from_slice(&c.to_ne_bytes());
    host[16..24].copy_from_slice(&d.to_ne_bytes());
    host
}

fn var_registry() -> Registry {
    Registry::new(
        vec![(2, 1002)],
        vec![Dataset {
            id: 1002,
            elements: vec![
                DatasetElement {
                    type_id: DataType::UInt8 as u32,
                    count: 1,
                },
                DatasetElement {
                    type_id: DataType::UInt16 as u32,
                    count: VAR_SIZE,
                },
            ],
        }],
    )
}

proptest! {
    #[test]
    fn pd_frame_survives_seal_and_check(
        seq in any::<u32>(),
        com_id in 1u32..=u32::MAX,
        etb in any::<u32>(),
        payload in proptest::collection::vec(any::<u8>(), 1..=64),
    ) {
        let frame = build_pd_frame(seq, com_id, etb, &payload);
        let header = frame::check_pd(&frame).unwrap();
        prop_assert_eq!(header.sequence_counter.get(), seq);
        prop_assert_eq!(header.com_id.get(), com_id);
        prop_assert_eq!(header.etb_topo_cnt.get(), etb);
        prop_assert_eq!(
            &frame[PD_HEADER_SIZE..PD_HEADER_SIZE + payload.len()],
            payload.as_slice()
        );
    }

    #[test]
    fn pd_frame_rejects_any_bit_flip(
        seq in any::<u32>(),
        com_id in 1u32..=u32::MAX,
        payload in proptest::collection::vec(any::<u8>(), 1..=64),
        flip_byte in any::<u16>(),
        flip_bit in 0u8..8,
    ) {
        let mut frame = build_pd_frame(seq, com_id, 0, &payload);
        let pos = flip_byte as usize % frame.len();
        frame[pos] ^= 1 << flip_bit;
        prop_assert!(frame::check_pd(&frame).is_err(), "flip at {} undetected", pos);
    }

    #[test]
    fn scalar_marshalling_roundtrips(
        a in any::<u8>(),
        b in any::<u32>(),
        c in any::<u16>(),
        d in any::<i64>(),
    ) {
        let registry = scalar_registry();
        let host = scalar_host(a, b, c, d);
        let mut wire = vec![0u8; 64];
        let n = registry.marshall(1, &host, &mut wire).unwrap();
        // Packed: 1 + 4 + 2 + 8.
        prop_assert_eq!(n, 15);

        let mut back = vec![0u8; host.len()];
        let m = registry.unmarshall(1, &wire[..n], &mut back).unwrap();
        prop_assert_eq!(m, host.len());
        prop_assert_eq!(back, host);
    }

    #[test]
    fn variable_array_roundtrips(items in proptest::collection::vec(any::<u16>(), 0..=40)) {
        let registry = var_registry();
        let count = items.len() as u8;
        // The u16 items re-align to offset 2; an empty array ends right
        // after the count byte.
        let host_len = if items.is_empty() { 1 } else { 2 + 2 * items.len() };
        let mut host = vec![0u8; host_len];
        host[0] = count;
        for (i, v) in items.iter().enumerate() {
            host[2 + 2 * i..4 + 2 * i].copy_from_slice(&v.to_ne_bytes());
        }

        let mut wire = vec![0u8; 4 + 2 * items.len()];
        let n = registry.marshall(2, &host, &mut wire).unwrap();
        prop_assert_eq!(n, 1 + 2 + 2 * items.len());

        let mut back = vec![0u8; host.len()];
        let m = registry.unmarshall(2, &wire[..n], &mut back).unwrap();
        prop_assert_eq!(m, host.len());
        prop_assert_eq!(back, host);
    }

    #[test]
    fn marshalled_payload_survives_frame_fcs(
        a in any::<u8>(),
        b in any::<u32>(),
        c in any::<u16>(),
        d in any::<i64>(),
    ) {
        // marshal -> seal -> check -> unmarshal is the identity on host
        // images (the CRC round trip law).
        let registry = scalar_registry();
        let host = scalar_host(a, b, c, d);
        let mut wire = vec![0u8; 64];
        let n = registry.marshall(1, &host, &mut wire).unwrap();

        let frame = build_pd_frame(1, 1, 0, &wire[..n]);
        let header = frame::check_pd(&frame).unwrap();
        let data_len = header.dataset_length.get() as usize;
        prop_assert_eq!(data_len, n);

        let mut back = vec![0u8; host.len()];
        registry
            .unmarshall(1, &frame[PD_HEADER_SIZE..PD_HEADER_SIZE + data_len], &mut back)
            .unwrap();
        prop_assert_eq!(back, host);
    }
}

#[test]
fn fcs_size_constant_matches_wire() {
    // The payload FCS is the last four octets of a sealed frame.
    let frame = build_pd_frame(1, 1, 0, b"abcd");
    let fcs = frame::fcs32(&frame[PD_HEADER_SIZE..PD_HEADER_SIZE + 4]);
    assert_eq!(frame[frame.len() - FCS_SIZE..], fcs.to_le_bytes());
}
