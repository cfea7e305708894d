// Test vectors for encoding and decoding Tor61 cells.
//
// Each vector gives the meaningful prefix of a cell; the rest of the
// cell is zero padding up to a multiple of 512 bytes.

use tor61_cell::cell::{Cell, CELL_LEN};
use tor61_cell::{Agent, FrameReader, RawCell, RelayCell, RelayCmd, RelayTarget};

use hex_literal::hex;

fn padded(prefix: &[u8], total: usize) -> Vec<u8> {
    let mut v = prefix.to_vec();
    v.resize(total, 0);
    v
}

fn vector(prefix: &[u8], cell: Cell) {
    let expect = padded(prefix, cell.encode().unwrap().len());
    let encoded = cell.encode().unwrap();
    assert_eq!(encoded.as_bytes(), &expect[..]);
    assert_eq!(Cell::decode(&expect).unwrap(), cell);

    // Framing gives back the same bytes.
    let mut fr = FrameReader::new();
    fr.feed(&expect);
    let framed: RawCell = fr.next_cell().unwrap();
    assert_eq!(framed, encoded);
}

#[test]
fn open_family() {
    vector(
        &hex!("0000 05 00010002 00030004"),
        Cell::Open {
            opener: Agent::new(1, 2),
            opened: Agent::new(3, 4),
        },
    );
    vector(
        &hex!("0000 06 00010002 00030004"),
        Cell::Opened {
            opener: Agent::new(1, 2),
            opened: Agent::new(3, 4),
        },
    );
    vector(
        &hex!("0000 07 00010002 00030004"),
        Cell::OpenFailed {
            opener: Agent::new(1, 2),
            opened: Agent::new(3, 4),
        },
    );
}

#[test]
fn circuit_control() {
    vector(&hex!("0001 01"), Cell::Create(1.into()));
    vector(&hex!("0003 02"), Cell::Created(3.into()));
    vector(&hex!("fffe 04"), Cell::Destroy(0xfffe.into()));
    vector(&hex!("0010 08"), Cell::CreateFailed(0x10.into()));
}

#[test]
fn relay() {
    vector(
        &hex!("0005 03 0007 0000 00000000 0013 01 7777772e6578616d706c652e636f6d3a383000"),
        Cell::Relay(RelayCell::new(
            5.into(),
            7.into(),
            RelayCmd::BEGIN,
            RelayTarget::stream("www.example.com", 80).encode(),
        )),
    );
    vector(
        &hex!("0005 03 0007 0000 00000000 0000 04"),
        Cell::Relay(RelayCell::empty(5.into(), 7.into(), RelayCmd::CONNECTED)),
    );
    vector(
        &hex!("0005 03 0000 0000 00000000 0000 0c"),
        Cell::Relay(RelayCell::empty(5.into(), 0.into(), RelayCmd::EXTEND_FAILED)),
    );
    vector(
        &hex!("0009 03 0000 0000 00000000 0012 06 31302e302e302e373a3430303100 00050001"),
        Cell::Relay(RelayCell::new(
            9.into(),
            0.into(),
            RelayCmd::EXTEND,
            RelayTarget::router("10.0.0.7", 4001, Agent::new(5, 1)).encode(),
        )),
    );
}

#[test]
fn multi_cell_sizes() {
    for body_len in [0_usize, 1, 497, 498, 499, 1000, 1010, 1011, 65535].iter() {
        let cell = Cell::Relay(RelayCell::new(
            1.into(),
            1.into(),
            RelayCmd::DATA,
            vec![0x42_u8; *body_len],
        ));
        let raw = cell.encode().unwrap();
        let expect = if *body_len <= 498 {
            CELL_LEN
        } else {
            CELL_LEN * ((body_len + 14 + CELL_LEN - 1) / CELL_LEN)
        };
        assert_eq!(raw.len(), expect, "body length {}", body_len);
        assert_eq!(raw.decode().unwrap(), cell);
    }
}

#[test]
fn interleaved_stream() {
    // A long relay cell between two short ones, delivered one byte at
    // a time.
    let cells = vec![
        Cell::Create(2.into()),
        Cell::Relay(RelayCell::new(
            2.into(),
            3.into(),
            RelayCmd::DATA,
            vec![9_u8; 2000],
        )),
        Cell::Relay(RelayCell::empty(2.into(), 3.into(), RelayCmd::END)),
    ];
    let mut bytes = Vec::new();
    for c in &cells {
        bytes.extend_from_slice(c.encode().unwrap().as_bytes());
    }
    let mut fr = FrameReader::new();
    let mut got = Vec::new();
    for b in bytes.iter() {
        fr.feed(std::slice::from_ref(b));
        got.extend(fr.drain().map(|c| c.decode().unwrap()));
    }
    assert_eq!(got, cells);
}
