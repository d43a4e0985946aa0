use core_proto::frame::{make_frame_header, FrameFlags, FrameType};
use core_proto::system_event;
use core_readout::{
    ModuleReadoutParts, ParseError, ReadoutConsumer, ReadoutParser, ReadoutStructure,
};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    BeginEvent(usize),
    Prefix(usize, usize, Vec<u32>),
    Dynamic(usize, usize, Vec<u32>),
    Suffix(usize, usize, Vec<u32>),
    EndEvent(usize),
    SystemEvent(u8, Vec<u32>),
}

#[derive(Default)]
struct Recorder {
    calls: Vec<Call>,
}

impl ReadoutConsumer for Recorder {
    fn begin_event(&mut self, ei: usize) {
        self.calls.push(Call::BeginEvent(ei));
    }

    fn module_prefix(&mut self, ei: usize, mi: usize, data: &[u32]) {
        self.calls.push(Call::Prefix(ei, mi, data.to_vec()));
    }

    fn module_dynamic(&mut self, ei: usize, mi: usize, data: &[u32]) {
        self.calls.push(Call::Dynamic(ei, mi, data.to_vec()));
    }

    fn module_suffix(&mut self, ei: usize, mi: usize, data: &[u32]) {
        self.calls.push(Call::Suffix(ei, mi, data.to_vec()));
    }

    fn end_event(&mut self, ei: usize) {
        self.calls.push(Call::EndEvent(ei));
    }

    fn system_event(&mut self, subtype: u8, data: &[u32]) {
        self.calls.push(Call::SystemEvent(subtype, data.to_vec()));
    }
}

fn stack_header(stack: u8, len: u16, flags: FrameFlags) -> u32 {
    make_frame_header(FrameType::StackFrame, flags, stack, 0, len)
}

fn continuation_header(stack: u8, len: u16, flags: FrameFlags) -> u32 {
    make_frame_header(FrameType::StackContinuation, flags, stack, 0, len)
}

fn block_header(len: u16, flags: FrameFlags) -> u32 {
    make_frame_header(FrameType::BlockRead, flags, 0, 0, len)
}

fn one_module(prefix_len: u8, has_dynamic: bool, suffix_len: u8) -> ReadoutStructure {
    vec![vec![ModuleReadoutParts {
        prefix_len,
        suffix_len,
        has_dynamic,
    }]]
}

/// Wraps a word slice into one eth packet with headers.
fn eth_packet(packet_number: u16, next_header_pointer: u32, payload: &[u32]) -> Vec<u32> {
    let header0 = ((packet_number as u32 & 0xfff) << 16) | payload.len() as u32;
    let header1 = next_header_pointer & 0xfff;
    let mut words = vec![header0, header1];
    words.extend_from_slice(payload);
    words
}

#[test]
fn single_event_all_parts() {
    let structure = one_module(2, true, 1);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    // prefix(2) + block header + block payload(3) + suffix(1)
    let buffer = vec![
        stack_header(1, 7, FrameFlags::empty()),
        0x1001,
        0x1002,
        block_header(3, FrameFlags::empty()),
        0x2001,
        0x2002,
        0x2003,
        0x3001,
    ];

    parser.parse_buffer_usb(&mut rec, 1, &buffer).unwrap();

    assert_eq!(
        rec.calls,
        vec![
            Call::BeginEvent(0),
            Call::Prefix(0, 0, vec![0x1001, 0x1002]),
            Call::Dynamic(0, 0, vec![0x2001, 0x2002, 0x2003]),
            Call::Suffix(0, 0, vec![0x3001]),
            Call::EndEvent(0),
        ]
    );
    assert_eq!(parser.counters.events_dispatched, 1);
    assert_eq!(parser.counters.total_parse_errors(), 0);
}

#[test]
fn event_split_across_buffers_resumes_with_saved_words_left() {
    // Scenario: a buffer ends one word short of the stack frame; the next
    // buffer starts mid-payload. No header scan may happen in between.
    let structure = one_module(0, true, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    let first = vec![
        stack_header(1, 4, FrameFlags::empty()),
        block_header(3, FrameFlags::empty()),
        0xAAA1,
        0xAAA2,
    ];
    let second = vec![0xAAA3];

    parser.parse_buffer_usb(&mut rec, 1, &first).unwrap();
    assert!(rec.calls.is_empty());

    parser.parse_buffer_usb(&mut rec, 2, &second).unwrap();

    assert_eq!(
        rec.calls,
        vec![
            Call::BeginEvent(0),
            Call::Dynamic(0, 0, vec![0xAAA1, 0xAAA2, 0xAAA3]),
            Call::EndEvent(0),
        ]
    );
    assert_eq!(parser.counters.error_count(ParseError::NoHeaderPresent), 0);
    assert_eq!(parser.counters.total_parse_errors(), 0);
}

#[test]
fn zero_length_block_frame_still_dispatches_event() {
    let structure = one_module(0, true, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    let buffer = vec![
        stack_header(1, 1, FrameFlags::empty()),
        block_header(0, FrameFlags::empty()),
    ];

    parser.parse_buffer_usb(&mut rec, 1, &buffer).unwrap();

    assert_eq!(
        rec.calls,
        vec![
            Call::BeginEvent(0),
            Call::Dynamic(0, 0, vec![]),
            Call::EndEvent(0),
        ]
    );
}

#[test]
fn module_with_no_parts_contributes_nothing() {
    let structure = vec![vec![
        ModuleReadoutParts::default(),
        ModuleReadoutParts {
            prefix_len: 1,
            suffix_len: 0,
            has_dynamic: false,
        },
    ]];
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    let buffer = vec![stack_header(1, 1, FrameFlags::empty()), 0x42];

    parser.parse_buffer_usb(&mut rec, 1, &buffer).unwrap();

    assert_eq!(
        rec.calls,
        vec![
            Call::BeginEvent(0),
            Call::Prefix(0, 1, vec![0x42]),
            Call::EndEvent(0),
        ]
    );
}

#[test]
fn stack_continuation_concatenates_block_parts() {
    let structure = one_module(0, true, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    let buffer = vec![
        stack_header(1, 3, FrameFlags::CONTINUE),
        block_header(2, FrameFlags::CONTINUE),
        0x1,
        0x2,
        continuation_header(1, 3, FrameFlags::empty()),
        block_header(2, FrameFlags::empty()),
        0x3,
        0x4,
    ];

    parser.parse_buffer_usb(&mut rec, 1, &buffer).unwrap();

    assert_eq!(
        rec.calls,
        vec![
            Call::BeginEvent(0),
            Call::Dynamic(0, 0, vec![0x1, 0x2, 0x3, 0x4]),
            Call::EndEvent(0),
        ]
    );
}

#[test]
fn continuation_with_wrong_stack_is_an_error() {
    let structure = vec![
        vec![ModuleReadoutParts { prefix_len: 0, suffix_len: 0, has_dynamic: true }],
        vec![ModuleReadoutParts { prefix_len: 0, suffix_len: 0, has_dynamic: true }],
    ];
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    let buffer = vec![
        stack_header(1, 3, FrameFlags::CONTINUE),
        block_header(2, FrameFlags::CONTINUE),
        0x1,
        0x2,
        continuation_header(2, 1, FrameFlags::empty()),
        block_header(0, FrameFlags::empty()),
    ];

    let err = parser.parse_buffer_usb(&mut rec, 1, &buffer).unwrap_err();
    assert_eq!(err, ParseError::StackIndexChanged);
    assert_eq!(parser.counters.error_count(ParseError::StackIndexChanged), 1);
    assert!(rec.calls.is_empty());
}

#[test]
fn missing_continuation_is_an_error() {
    let structure = one_module(2, false, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    // Frame claims one word but the module needs two; the next stack frame
    // appears where the continuation should be.
    let buffer = vec![
        stack_header(1, 1, FrameFlags::CONTINUE),
        0x1,
        stack_header(1, 2, FrameFlags::empty()),
        0x2,
        0x3,
    ];

    let err = parser.parse_buffer_usb(&mut rec, 1, &buffer).unwrap_err();
    assert_eq!(err, ParseError::NotAStackContinuation);
}

#[test]
fn garbage_word_outside_frames_is_not_a_stack_frame() {
    let structure = one_module(1, false, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    let err = parser
        .parse_buffer_usb(&mut rec, 1, &[0x1234_5678])
        .unwrap_err();
    assert_eq!(err, ParseError::NotAStackFrame);
}

#[test]
fn stack_index_outside_structure_is_rejected() {
    let structure = one_module(1, false, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    let buffer = vec![stack_header(5, 1, FrameFlags::empty()), 0x1];
    let err = parser.parse_buffer_usb(&mut rec, 1, &buffer).unwrap_err();
    assert_eq!(err, ParseError::EventIndexOutOfRange);

    // Stack 0 is the immediate stack and never carries readout data.
    let buffer = vec![stack_header(0, 1, FrameFlags::empty()), 0x1];
    let err = parser.parse_buffer_usb(&mut rec, 2, &buffer).unwrap_err();
    assert_eq!(err, ParseError::EventIndexOutOfRange);
}

#[test]
fn empty_stack_frame_for_nonempty_event_is_an_error() {
    let structure = one_module(1, false, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    let buffer = vec![stack_header(1, 0, FrameFlags::empty())];
    let err = parser.parse_buffer_usb(&mut rec, 1, &buffer).unwrap_err();
    assert_eq!(err, ParseError::EmptyStackFrame);
}

#[test]
fn non_block_word_in_dynamic_part_is_an_error() {
    let structure = one_module(0, true, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    let buffer = vec![stack_header(1, 2, FrameFlags::empty()), 0xDEAD_BEEF, 0x0];
    let err = parser.parse_buffer_usb(&mut rec, 1, &buffer).unwrap_err();
    assert_eq!(err, ParseError::NotABlockFrame);
}

#[test]
fn system_event_is_delivered_with_payload() {
    let structure = one_module(1, false, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    let buffer = vec![
        system_event::make_header(system_event::subtype::UNIX_TIMESTAMP, 2, false),
        0x1111,
        0x2222,
    ];

    parser.parse_buffer_usb(&mut rec, 1, &buffer).unwrap();

    assert_eq!(
        rec.calls,
        vec![Call::SystemEvent(
            system_event::subtype::UNIX_TIMESTAMP,
            vec![0x1111, 0x2222]
        )]
    );
    assert_eq!(
        parser.counters.system_events[system_event::subtype::UNIX_TIMESTAMP as usize],
        1
    );
}

#[test]
fn continued_system_event_parts_are_rejoined() {
    let structure = one_module(1, false, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    let first = vec![
        system_event::make_header(system_event::subtype::VME_CONFIG, 2, true),
        0xA,
        0xB,
    ];
    let second = vec![
        system_event::make_header(system_event::subtype::VME_CONFIG, 1, false),
        0xC,
    ];

    parser.parse_buffer_usb(&mut rec, 1, &first).unwrap();
    assert!(rec.calls.is_empty());

    parser.parse_buffer_usb(&mut rec, 2, &second).unwrap();
    assert_eq!(
        rec.calls,
        vec![Call::SystemEvent(
            system_event::subtype::VME_CONFIG,
            vec![0xA, 0xB, 0xC]
        )]
    );
}

#[test]
fn buffer_loss_is_counted_and_resets_state() {
    let structure = one_module(0, true, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    // Open an event that would need a continuation.
    let first = vec![
        stack_header(1, 3, FrameFlags::CONTINUE),
        block_header(4, FrameFlags::CONTINUE),
        0x1,
        0x2,
    ];
    parser.parse_buffer_usb(&mut rec, 1, &first).unwrap();

    // Buffers 2 and 3 are lost; buffer 4 starts a new event.
    let fourth = vec![
        stack_header(1, 2, FrameFlags::empty()),
        block_header(1, FrameFlags::empty()),
        0x9,
    ];
    parser.parse_buffer_usb(&mut rec, 4, &fourth).unwrap();

    assert_eq!(parser.counters.internal_buffer_loss, 2);
    assert_eq!(
        rec.calls,
        vec![
            Call::BeginEvent(0),
            Call::Dynamic(0, 0, vec![0x9]),
            Call::EndEvent(0),
        ]
    );
}

#[test]
fn eth_packets_parse_and_count() {
    let structure = one_module(1, false, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    let payload = vec![stack_header(1, 1, FrameFlags::empty()), 0x77];
    let buffer = eth_packet(0, 0, &payload);

    parser.parse_buffer_eth(&mut rec, 1, &buffer).unwrap();

    assert_eq!(parser.counters.eth_packets_processed, 1);
    assert_eq!(
        rec.calls,
        vec![
            Call::BeginEvent(0),
            Call::Prefix(0, 0, vec![0x77]),
            Call::EndEvent(0),
        ]
    );
}

#[test]
fn eth_event_spans_packets() {
    let structure = one_module(0, true, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    let part1 = vec![
        stack_header(1, 3, FrameFlags::empty()),
        block_header(2, FrameFlags::empty()),
        0x1,
    ];
    // Continuation-only packet: no embedded header.
    let part2 = vec![0x2];

    let mut buffer = eth_packet(0, 0, &part1);
    buffer.extend(eth_packet(1, 0xfff, &part2));

    parser.parse_buffer_eth(&mut rec, 1, &buffer).unwrap();

    assert_eq!(
        rec.calls,
        vec![
            Call::BeginEvent(0),
            Call::Dynamic(0, 0, vec![0x1, 0x2]),
            Call::EndEvent(0),
        ]
    );
}

#[test]
fn eth_packet_loss_resyncs_via_next_header_pointer() {
    let structure = one_module(0, true, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    // Packet 0 opens an event whose block continues in the lost packet 1.
    let part1 = vec![
        stack_header(1, 4, FrameFlags::empty()),
        block_header(3, FrameFlags::empty()),
        0x1,
    ];

    // Packet 2 (after the loss) carries two leftover continuation words of
    // the broken event, then a fresh complete event at offset 2.
    let part3 = vec![
        0xBAD1,
        0xBAD2,
        stack_header(1, 2, FrameFlags::empty()),
        block_header(1, FrameFlags::empty()),
        0x9,
    ];

    let mut buffer = eth_packet(0, 0, &part1);
    buffer.extend(eth_packet(2, 2, &part3));

    parser.parse_buffer_eth(&mut rec, 1, &buffer).unwrap();

    assert_eq!(parser.counters.eth_packet_loss, 1);
    // Only the post-loss event is delivered; the leftover words count as
    // unused.
    assert_eq!(
        rec.calls,
        vec![
            Call::BeginEvent(0),
            Call::Dynamic(0, 0, vec![0x9]),
            Call::EndEvent(0),
        ]
    );
    assert!(parser.counters.unused_bytes >= 8);
}

#[test]
fn eth_continuation_only_packet_while_idle_is_skipped() {
    let structure = one_module(0, true, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    let buffer = eth_packet(0, 0xfff, &[0x1, 0x2, 0x3]);
    parser.parse_buffer_eth(&mut rec, 1, &buffer).unwrap();

    assert!(rec.calls.is_empty());
    assert_eq!(parser.counters.unused_bytes, 12);
}

#[test]
fn usb_error_recovery_drops_rest_of_buffer_then_continues() {
    let structure = one_module(1, false, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    let bad = vec![0xDEAD_0000, 0xDEAD_0001];
    assert!(parser.parse_buffer_usb(&mut rec, 1, &bad).is_err());
    assert_eq!(parser.counters.unused_bytes, 8);

    let good = vec![stack_header(1, 1, FrameFlags::empty()), 0x5];
    parser.parse_buffer_usb(&mut rec, 2, &good).unwrap();

    assert_eq!(
        rec.calls,
        vec![
            Call::BeginEvent(0),
            Call::Prefix(0, 0, vec![0x5]),
            Call::EndEvent(0),
        ]
    );
}

#[test]
fn multiple_events_in_one_buffer() {
    let structure = vec![
        vec![ModuleReadoutParts { prefix_len: 1, suffix_len: 0, has_dynamic: false }],
        vec![ModuleReadoutParts { prefix_len: 0, suffix_len: 0, has_dynamic: true }],
    ];
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    let buffer = vec![
        stack_header(1, 1, FrameFlags::empty()),
        0x10,
        stack_header(2, 2, FrameFlags::empty()),
        block_header(1, FrameFlags::empty()),
        0x20,
        stack_header(1, 1, FrameFlags::empty()),
        0x30,
    ];

    parser.parse_buffer_usb(&mut rec, 1, &buffer).unwrap();

    assert_eq!(parser.counters.events_dispatched, 3);
    assert_eq!(
        rec.calls,
        vec![
            Call::BeginEvent(0),
            Call::Prefix(0, 0, vec![0x10]),
            Call::EndEvent(0),
            Call::BeginEvent(1),
            Call::Dynamic(1, 0, vec![0x20]),
            Call::EndEvent(1),
            Call::BeginEvent(0),
            Call::Prefix(0, 0, vec![0x30]),
            Call::EndEvent(0),
        ]
    );
}

#[test]
fn new_stack_frame_while_block_frame_open_is_an_error() {
    let structure = one_module(0, true, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    // The block frame claims 4 words but its stack frame carries only two
    // of them and ends without the continue flag; a fresh stack frame
    // follows where the continuation should be.
    let buffer = vec![
        stack_header(1, 3, FrameFlags::empty()),
        block_header(4, FrameFlags::empty()),
        0x1,
        0x2,
        stack_header(1, 2, FrameFlags::empty()),
        block_header(1, FrameFlags::empty()),
        0x9,
    ];

    let err = parser.parse_buffer_usb(&mut rec, 1, &buffer).unwrap_err();
    assert_eq!(err, ParseError::UnexpectedOpenBlockFrame);
    assert_eq!(
        parser.counters.error_count(ParseError::UnexpectedOpenBlockFrame),
        1
    );
    assert!(rec.calls.is_empty());

    // The next buffer parses normally again.
    let good = vec![
        stack_header(1, 2, FrameFlags::empty()),
        block_header(1, FrameFlags::empty()),
        0x9,
    ];
    parser.parse_buffer_usb(&mut rec, 2, &good).unwrap();
    assert_eq!(parser.counters.events_dispatched, 1);
}

#[test]
fn eth_truncated_packet_is_a_packet_watchdog_error() {
    let structure = one_module(0, true, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    // Header claims five payload words; only two follow.
    let header0 = 5u32;
    let header1 = 0u32;
    let buffer = vec![header0, header1, 0x1, 0x2];

    let err = parser.parse_buffer_eth(&mut rec, 1, &buffer).unwrap_err();
    assert_eq!(err, ParseError::EthPacketNotAdvancing);
    assert_eq!(
        parser.counters.error_count(ParseError::EthPacketNotAdvancing),
        1
    );
    assert_eq!(parser.counters.unused_bytes, 16);
    assert!(rec.calls.is_empty());
}

#[test]
fn eth_trailing_fragment_is_a_buffer_watchdog_error() {
    let structure = one_module(1, false, 0);
    let mut parser = ReadoutParser::new(structure).unwrap();
    let mut rec = Recorder::default();

    let payload = vec![stack_header(1, 1, FrameFlags::empty()), 0x77];
    let mut buffer = eth_packet(0, 0, &payload);
    // One stray word after the last packet: too short for a packet header.
    buffer.push(0xABCD);

    let err = parser.parse_buffer_eth(&mut rec, 1, &buffer).unwrap_err();
    assert_eq!(err, ParseError::EthBufferNotAdvancing);
    assert_eq!(
        parser.counters.error_count(ParseError::EthBufferNotAdvancing),
        1
    );
    assert_eq!(parser.counters.unused_bytes, 4);

    // The packet before the fragment was still fully processed.
    assert_eq!(parser.counters.events_dispatched, 1);
    assert_eq!(
        rec.calls,
        vec![
            Call::BeginEvent(0),
            Call::Prefix(0, 0, vec![0x77]),
            Call::EndEvent(0),
        ]
    );
}

#[test]
fn structures_with_too_many_modules_are_rejected() {
    let structure = vec![vec![
        ModuleReadoutParts::default();
        core_readout::MAX_MODULES_PER_EVENT + 1
    ]];

    assert!(matches!(
        ReadoutParser::new(structure),
        Err(ParseError::ModuleIndexOutOfRange)
    ));
}
