// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the encode loop against a scripted component

mod common;

use common::{Refusal, Script, ScriptedEncoder};
use std::time::Duration;
use stillcap::backends::codec::{CodecStatus, ImageCodec, PortDirection, PortFormat, encodings};
use stillcap::errors::CodecError;
use stillcap::pipelines::photo::{CodecPipeline, PipelineOptions};

fn input_format() -> PortFormat {
    PortFormat::new(encodings::YUYV, 32, 16)
}

fn options() -> PipelineOptions {
    PipelineOptions {
        wait_timeout: Duration::from_millis(200),
        ..PipelineOptions::default()
    }
}

fn chunks(names: &[&str]) -> Vec<Vec<u8>> {
    names.iter().map(|n| n.as_bytes().to_vec()).collect()
}

#[test]
fn test_empty_input_sends_only_end_of_stream() {
    let (component, log) = ScriptedEncoder::new(Script::default());
    let mut pipeline =
        CodecPipeline::with_component(component, input_format(), ImageCodec::Png, options())
            .unwrap();

    let encoded = pipeline.encode(&[]).unwrap();
    assert!(encoded.is_complete());
    assert!(encoded.data.is_empty());

    let log = log.lock().unwrap().clone();
    assert!(log.input.is_empty());
    assert_eq!(log.input_eos, 1);
    assert!(log.enabled);
}

#[test]
fn test_input_is_chunked_and_output_kept_in_arrival_order() {
    let script = Script {
        chunks: chunks(&["aa", "bb", "cc", "dd", "ee", "ff"]),
        ..Script::default()
    };
    let (component, log) = ScriptedEncoder::new(script);
    let mut pipeline =
        CodecPipeline::with_component(component, input_format(), ImageCodec::Jpeg, options())
            .unwrap();

    let input: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    let encoded = pipeline.encode(&input).unwrap();

    assert!(encoded.is_complete());
    assert_eq!(encoded.data, b"aabbccddeeff");

    let log = log.lock().unwrap().clone();
    assert_eq!(log.input, input);
    assert_eq!(log.input_eos, 1);
    // Returned out of index order, reassembled by arrival
    assert_eq!(log.emitted_indices, vec![3, 2, 1, 0, 0, 1]);

    assert!(pipeline.input_stats().is_balanced());
    assert!(pipeline.output_stats().is_balanced());
    assert_eq!(pipeline.renegotiations(), 0);
}

#[test]
fn test_format_change_rebuilds_output_pool_once() {
    let script = Script {
        chunks: chunks(&["c0", "c1", "c2"]),
        format_change_before: Some(1),
        ..Script::default()
    };
    let (component, log) = ScriptedEncoder::new(script);
    let mut pipeline =
        CodecPipeline::with_component(component, input_format(), ImageCodec::Png, options())
            .unwrap();

    let encoded = pipeline.encode(b"frame").unwrap();
    assert!(encoded.is_complete());
    assert_eq!(encoded.data, b"c0c1c2");
    assert_eq!(pipeline.renegotiations(), 1);

    let stats = pipeline.output_stats();
    assert_eq!(stats.generation, 1);
    assert_eq!(stats.total, 2);
    assert!(stats.is_balanced());

    pipeline.close().unwrap();

    let log = log.lock().unwrap().clone();
    assert!(log.pools_created.contains(&(PortDirection::Output, 4, 64)));
    assert!(log.pools_created.contains(&(PortDirection::Output, 2, 128)));
    assert_eq!(
        log.pools_released,
        vec![
            (PortDirection::Output, 4),
            (PortDirection::Input, 2),
            (PortDirection::Output, 2),
        ]
    );
    assert!(log.disabled);
}

#[test]
fn test_latched_error_returns_partial_output() {
    let script = Script {
        chunks: chunks(&["p0", "p1", "p2", "p3"]),
        fail_before: Some((2, CodecStatus::Corrupt)),
        ..Script::default()
    };
    let (component, _log) = ScriptedEncoder::new(script);
    let mut pipeline =
        CodecPipeline::with_component(component, input_format(), ImageCodec::Png, options())
            .unwrap();

    let encoded = pipeline.encode(b"frame").unwrap();
    assert!(!encoded.is_complete());
    assert!(!encoded.end_of_stream);
    assert_eq!(encoded.error, Some(CodecStatus::Corrupt));
    assert_eq!(encoded.data, b"p0p1");
    assert_eq!(pipeline.latched_error(), Some(CodecStatus::Corrupt));

    // The latch stays set for later frames
    let again = pipeline.encode(b"frame").unwrap();
    assert!(again.data.is_empty());
    assert_eq!(again.error, Some(CodecStatus::Corrupt));
}

#[test]
fn test_header_margin_must_leave_room() {
    let (component, _log) = ScriptedEncoder::new(Script::default());
    let options = PipelineOptions {
        input_header_margin: 1024,
        ..options()
    };

    let result = CodecPipeline::with_component(component, input_format(), ImageCodec::Png, options);
    assert!(matches!(result, Err(CodecError::FormatNotSupported(_))));
}

#[test]
fn test_close_disables_ports_then_component() {
    let (component, log) = ScriptedEncoder::new(Script::default());
    let pipeline =
        CodecPipeline::with_component(component, input_format(), ImageCodec::Bmp, options())
            .unwrap();
    pipeline.close().unwrap();

    let log = log.lock().unwrap().clone();
    assert_eq!(
        log.port_disables,
        vec![PortDirection::Input, PortDirection::Output]
    );
    assert!(log.disabled);
}

#[test]
fn test_rejected_input_buffer_is_fatal_and_recycled() {
    let script = Script {
        refuse: Some(Refusal {
            direction: PortDirection::Input,
            nth: 1,
            status: CodecStatus::NoMemory,
            keep: false,
        }),
        ..Script::default()
    };
    let (component, log) = ScriptedEncoder::new(script);
    let mut pipeline =
        CodecPipeline::with_component(component, input_format(), ImageCodec::Png, options())
            .unwrap();

    let input = vec![0x55u8; 2000];
    let result = pipeline.encode(&input);
    assert!(matches!(
        result,
        Err(CodecError::SubmitRejected {
            direction: PortDirection::Input,
            status: CodecStatus::NoMemory,
        })
    ));

    // The refused buffer was handed back and sits on the free list
    let stats = pipeline.input_stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.free, 1);
    assert!(stats.is_balanced());
    assert_eq!(log.lock().unwrap().refused.len(), 1);
}

#[test]
fn test_kept_rejected_buffer_shrinks_pool() {
    let script = Script {
        refuse: Some(Refusal {
            direction: PortDirection::Input,
            nth: 1,
            status: CodecStatus::Io,
            keep: true,
        }),
        ..Script::default()
    };
    let (component, _log) = ScriptedEncoder::new(script);
    let mut pipeline =
        CodecPipeline::with_component(component, input_format(), ImageCodec::Png, options())
            .unwrap();

    let result = pipeline.encode(&[0x55; 2000]);
    assert!(matches!(
        result,
        Err(CodecError::SubmitRejected {
            direction: PortDirection::Input,
            status: CodecStatus::Io,
        })
    ));

    let stats = pipeline.input_stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.free, 0);
    assert!(stats.is_balanced());
    pipeline.close().unwrap();
}

#[test]
fn test_rejected_output_resubmission_is_fatal() {
    // Four held buffers carry the first four chunks; refilling the first
    // recycled one is refused
    let script = Script {
        chunks: chunks(&["aa", "bb", "cc", "dd", "ee", "ff"]),
        refuse: Some(Refusal {
            direction: PortDirection::Output,
            nth: 4,
            status: CodecStatus::NoSpace,
            keep: false,
        }),
        ..Script::default()
    };
    let (component, log) = ScriptedEncoder::new(script);
    let mut pipeline =
        CodecPipeline::with_component(component, input_format(), ImageCodec::Jpeg, options())
            .unwrap();

    let result = pipeline.encode(b"frame");
    assert!(matches!(
        result,
        Err(CodecError::SubmitRejected {
            direction: PortDirection::Output,
            status: CodecStatus::NoSpace,
        })
    ));

    let stats = pipeline.output_stats();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.in_flight, 0);
    assert!(stats.is_balanced());
    assert_eq!(log.lock().unwrap().emitted_indices, vec![3, 2, 1, 0]);
}
