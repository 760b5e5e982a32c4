//! End-to-end tests of the acquisition loop against scripted devices and
//! recordings on disk.
//!
//! Run with: cargo test --test integration_tests

use caer_core::{
    output, Acquisition, AcquisitionConfig, AcquisitionError, AcquisitionState, AedatWriter,
    ConfigParam, DecodeError, Device, DeviceDescriptor, DeviceError, DeviceKind, DeviceOpener,
    EventPacketContainer, EventType, FieldOrder, FrameEvent, FrameMatrix, FramePolicy, Geometry,
    OpenRequest, PacketDecoder, PolarityEvent, RawSubPacket, ReplayOpener, SpecialEvent,
    SpikeEvent, StopToken,
};
use caer_core::device::HOST_CONFIG_DATAEXCHANGE;
use proptest::prelude::*;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

type CallLog = Rc<RefCell<Vec<&'static str>>>;

/// Device that replays scripted reads and logs every call.
struct MockDevice {
    descriptor: DeviceDescriptor,
    reads: VecDeque<Option<EventPacketContainer>>,
    fail_start: bool,
    fail_config_module: Option<i8>,
    calls: CallLog,
}

impl MockDevice {
    fn new(reads: Vec<Option<EventPacketContainer>>) -> (Self, CallLog) {
        let calls = CallLog::default();
        let device = Self {
            descriptor: DeviceDescriptor::davis(1, "MOCK0001", Geometry::new(240, 180)),
            reads: reads.into(),
            fail_start: false,
            fail_config_module: None,
            calls: calls.clone(),
        };
        (device, calls)
    }

    fn log(&self, call: &'static str) {
        self.calls.borrow_mut().push(call);
    }
}

impl Device for MockDevice {
    fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }

    fn send_default_config(&mut self) -> Result<(), DeviceError> {
        self.log("send_default_config");
        Ok(())
    }

    fn config_set(&mut self, module: i8, _param: u8, _value: u32) -> Result<(), DeviceError> {
        self.log("config_set");
        if self.fail_config_module == Some(module) {
            return Err(DeviceError::Rejected(format!("module {} unavailable", module)));
        }
        Ok(())
    }

    fn data_start(&mut self) -> Result<(), DeviceError> {
        self.log("data_start");
        if self.fail_start {
            return Err(DeviceError::Rejected("endpoint stalled".to_string()));
        }
        Ok(())
    }

    fn data_get(&mut self) -> Option<EventPacketContainer> {
        self.log("data_get");
        self.reads.pop_front().flatten()
    }

    fn data_stop(&mut self) {
        self.log("data_stop");
    }

    fn close(&mut self) {
        self.log("close");
    }
}

fn count(calls: &CallLog, name: &str) -> usize {
    calls.borrow().iter().filter(|c| **c == name).count()
}

fn polarity_packet(events: &[PolarityEvent]) -> RawSubPacket {
    let mut builder = RawSubPacket::builder(EventType::Polarity);
    for event in events {
        builder.push_polarity(event);
    }
    builder.build()
}

fn special_packet(n: usize) -> RawSubPacket {
    let mut builder = RawSubPacket::builder(EventType::Special);
    for i in 0..n {
        builder.push_special(&SpecialEvent::new(i as i32, 1, 0));
    }
    builder.build()
}

fn tick_container(n: usize) -> EventPacketContainer {
    let events: Vec<_> = (0..n)
        .map(|i| PolarityEvent::new(i as i32, (i % 240) as u16, 0, true))
        .collect();
    std::iter::once(polarity_packet(&events)).collect()
}

/// Starting the transfer fails: no reads, no stop, exactly one close.
#[test]
fn test_start_failure_closes_device() {
    let (mut device, calls) = MockDevice::new(vec![Some(tick_container(3))]);
    device.fail_start = true;

    let result = Acquisition::start(device, AcquisitionConfig::default());
    assert!(matches!(result, Err(AcquisitionError::Start(_))));

    assert_eq!(count(&calls, "data_get"), 0);
    assert_eq!(count(&calls, "data_stop"), 0);
    assert_eq!(count(&calls, "close"), 1);
}

/// Setup stopped before streaming: nothing read or stopped, one close.
fn assert_never_started(calls: &CallLog) {
    assert_eq!(count(calls, "data_start"), 0);
    assert_eq!(count(calls, "data_get"), 0);
    assert_eq!(count(calls, "data_stop"), 0);
    assert_eq!(count(calls, "close"), 1);
}

#[test]
fn test_exchange_mode_failure_closes_device() {
    let (mut device, calls) = MockDevice::new(vec![Some(tick_container(3))]);
    device.fail_config_module = Some(HOST_CONFIG_DATAEXCHANGE);

    let result = Acquisition::start(device, AcquisitionConfig::default());
    assert!(matches!(result, Err(AcquisitionError::ExchangeMode(_))));
    assert_never_started(&calls);
}

/// The error names the override that was refused; later steps never run.
#[test]
fn test_config_override_failure_names_param() {
    let config = AcquisitionConfig {
        config: vec![
            ConfigParam {
                module: 1,
                param: 2,
                value: 3,
            },
            ConfigParam {
                module: 5,
                param: 7,
                value: 1,
            },
        ],
        ..Default::default()
    };
    let (mut device, calls) = MockDevice::new(vec![Some(tick_container(3))]);
    device.fail_config_module = Some(5);

    match Acquisition::start(device, config) {
        Err(AcquisitionError::ConfigSet { module, param, .. }) => {
            assert_eq!((module, param), (5, 7));
        }
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("setup should have failed"),
    }
    assert_eq!(count(&calls, "config_set"), 2);
    assert_never_started(&calls);
}

/// Cancelling after container C: one stop, one close, no further reads.
#[test]
fn test_cancel_after_container() {
    const C: usize = 3;
    let reads = (0..10).map(|_| Some(tick_container(2))).collect();
    let (device, calls) = MockDevice::new(reads);

    let mut acquisition = Acquisition::start(device, AcquisitionConfig::default()).unwrap();
    let token = acquisition.stop_token();

    for _ in 0..C {
        let batches = acquisition.next_tick().unwrap();
        assert_eq!(batches.polarity.len(), 2);
    }
    token.cancel();
    assert!(acquisition.next_tick().is_none());
    assert_eq!(acquisition.state(), AcquisitionState::Closed);
    drop(acquisition);

    assert_eq!(count(&calls, "data_get"), C);
    assert_eq!(count(&calls, "data_stop"), 1);
    assert_eq!(count(&calls, "close"), 1);
    let log = calls.borrow();
    assert_eq!(&log[log.len() - 2..], ["data_stop", "close"]);
}

/// Cancellation from another thread ends a loop that only sees timeouts.
#[test]
fn test_cancel_from_other_thread() {
    let (device, calls) = MockDevice::new(Vec::new());
    let acquisition = Acquisition::start(device, AcquisitionConfig::default()).unwrap();
    let token: StopToken = acquisition.stop_token();

    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(5));
        token.cancel();
    });

    let ticks = acquisition.inspect(|b| assert!(b.is_empty())).count();
    canceller.join().unwrap();

    assert!(ticks > 0);
    assert_eq!(count(&calls, "data_stop"), 1);
    assert_eq!(count(&calls, "close"), 1);
}

#[test]
fn test_open_failure_is_device_not_found() {
    struct NoDevices;

    impl DeviceOpener for NoDevices {
        type Device = MockDevice;

        fn open(&self, request: &OpenRequest) -> Result<MockDevice, DeviceError> {
            Err(DeviceError::NotFound(format!("no {} attached", request.kind)))
        }
    }

    let request = OpenRequest::any(1, DeviceKind::Dvs128);
    let result = Acquisition::open(&NoDevices, &request, AcquisitionConfig::default());
    assert!(matches!(result, Err(AcquisitionError::DeviceNotFound(_))));
}

/// Per-type batch sizes are the sums of the declared counts.
#[test]
fn test_batch_sizes_match_declared_counts() {
    let a: Vec<_> = (0..4).map(|i| PolarityEvent::new(i, 1, 1, false)).collect();
    let b: Vec<_> = (0..7).map(|i| PolarityEvent::new(10 + i, 2, 2, true)).collect();

    let mut container = EventPacketContainer::new();
    container.push(special_packet(2));
    container.push(polarity_packet(&a));
    container.push_empty();
    container.push(polarity_packet(&b));

    let decoder = PacketDecoder::new(
        &DeviceDescriptor::davis(1, "", Geometry::new(240, 180)),
        Default::default(),
    );
    let batches = decoder.decode_container(container);

    assert_eq!(batches.polarity.len(), 11);
    assert_eq!(batches.special.len(), 2);
    assert_eq!(batches.polarity[..4], a[..]);
    assert_eq!(batches.polarity[4..], b[..]);
    assert!(batches.rejected.is_empty());
}

#[test]
fn test_container_without_sub_packets() {
    let (device, _calls) = MockDevice::new(vec![Some(EventPacketContainer::new())]);
    let mut acquisition = Acquisition::start(device, AcquisitionConfig::default()).unwrap();
    let batches = acquisition.next_tick().unwrap();
    assert!(batches.is_empty());
    assert!(batches.rejected.is_empty());
    assert_eq!(acquisition.containers_received(), 1);
}

/// A malformed sub-packet is dropped without affecting its siblings.
#[test]
fn test_malformed_sub_packet_isolated() {
    let mut bad = RawSubPacket::builder(EventType::Polarity).declared_count(3);
    bad.push_polarity(&PolarityEvent::new(0, 0, 0, true));
    bad.push_polarity(&PolarityEvent::new(1, 1, 1, true));

    let mut spikes = RawSubPacket::builder(EventType::Spike);
    spikes.push_spike(&SpikeEvent {
        timestamp: 9,
        neuron_id: 17,
        source_core_id: 1,
        chip_id: 2,
    });

    let container: EventPacketContainer =
        vec![bad.build(), special_packet(3), spikes.build()].into_iter().collect();
    let (device, _calls) = MockDevice::new(vec![Some(container)]);
    let mut acquisition = Acquisition::start(device, AcquisitionConfig::default()).unwrap();
    let batches = acquisition.next_tick().unwrap();

    assert!(batches.polarity.is_empty());
    assert_eq!(batches.special.len(), 3);
    assert_eq!(batches.spikes.len(), 1);
    assert_eq!(batches.spikes[0].neuron_id, 17);
    assert_eq!(batches.rejected.len(), 1);
    assert!(matches!(
        batches.rejected[0],
        DecodeError::MalformedPacket {
            event_type: EventType::Polarity,
            declared_count: 3,
            ..
        }
    ));
}

fn frame_packet(frames: &[(i32, [u16; 4])]) -> RawSubPacket {
    let mut builder = RawSubPacket::builder(EventType::Frame);
    for (ts, samples) in frames {
        let frame = FrameEvent {
            timestamp: *ts,
            ts_start_of_frame: *ts - 10,
            ts_end_of_frame: *ts + 10,
            ts_start_of_exposure: *ts - 5,
            ts_end_of_exposure: *ts + 5,
            length_x: 2,
            length_y: 2,
            position_x: 0,
            position_y: 0,
            channels: 1,
            roi_id: 0,
            pixels: FrameMatrix::zeros(2, 2),
        };
        builder.push_frame_samples(&frame, samples, 1);
    }
    builder.build()
}

#[test]
fn test_frame_matrix_from_acquisition() {
    let container: EventPacketContainer =
        std::iter::once(frame_packet(&[(100, [10, 20, 30, 40]), (200, [1, 2, 3, 4])])).collect();
    let (device, _calls) = MockDevice::new(vec![Some(container.clone()), Some(container)]);

    let mut acquisition = Acquisition::start(device, AcquisitionConfig::default()).unwrap();
    let first = acquisition.next_tick().unwrap();
    assert_eq!(first.frames.len(), 1);
    let pixels = &first.frames[0].pixels;
    assert_eq!(&pixels[0], &[10, 20]);
    assert_eq!(&pixels[1], &[30, 40]);
    assert_eq!(first.frames[0].timestamp, 100);
    acquisition.shutdown();

    let config = AcquisitionConfig {
        decoder: caer_core::DecoderOptions {
            frame_policy: FramePolicy::All,
            ..Default::default()
        },
        ..Default::default()
    };
    let (device, _calls) = MockDevice::new(vec![Some(
        std::iter::once(frame_packet(&[(100, [10, 20, 30, 40]), (200, [1, 2, 3, 4])])).collect(),
    )]);
    let mut acquisition = Acquisition::start(device, config).unwrap();
    assert_eq!(acquisition.next_tick().unwrap().frames.len(), 2);
}

#[test]
fn test_config_overrides_applied_before_start() {
    let config = AcquisitionConfig {
        config: vec![ConfigParam {
            module: 1,
            param: 2,
            value: 3,
        }],
        ..Default::default()
    };
    let (device, calls) = MockDevice::new(Vec::new());
    drop(Acquisition::start(device, config).unwrap());
    assert_eq!(
        *calls.borrow(),
        [
            "send_default_config",
            "config_set",
            "config_set",
            "data_start",
            "data_stop",
            "close"
        ]
    );
}

/// A recording written to disk replays through the acquisition loop.
#[test]
fn test_replay_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recording.aedat");

    let events: Vec<_> = (0..50)
        .map(|i| PolarityEvent::new(i * 10, (i % 128) as u16, (i % 7) as u16, i % 2 == 0))
        .collect();
    {
        let mut writer = AedatWriter::create(&path).unwrap();
        writer.write_header("DVS128").unwrap();
        for chunk in events.chunks(20) {
            let container: EventPacketContainer =
                vec![special_packet(1), polarity_packet(chunk)].into_iter().collect();
            writer.write_container(&container).unwrap();
        }
        writer.flush().unwrap();
    }

    let opener = ReplayOpener::new(&path);
    let request = OpenRequest::any(3, DeviceKind::Dvs128);
    let mut acquisition =
        Acquisition::open(&opener, &request, AcquisitionConfig::default()).unwrap();
    assert_eq!(acquisition.descriptor().dvs, Geometry::new(128, 128));
    assert_eq!(acquisition.descriptor().device_id, 3);

    let mut decoded = Vec::new();
    let mut specials = 0;
    while let Some(batches) = acquisition.next_tick() {
        if batches.is_empty() {
            break;
        }
        decoded.extend(batches.polarity);
        specials += batches.special.len();
    }
    assert_eq!(decoded, events);
    assert_eq!(specials, 3);
    assert_eq!(acquisition.containers_received(), 3);
}

/// A recording from an unlisted sensor keeps events beyond any known size.
#[test]
fn test_replay_unknown_source_keeps_polarity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dvxplorer.aedat");
    let event = PolarityEvent::new(10, 500, 400, true);
    {
        let mut writer = AedatWriter::create(&path).unwrap();
        writer.write_header("DVXplorer").unwrap();
        writer
            .write_container(&std::iter::once(polarity_packet(&[event])).collect())
            .unwrap();
        writer.flush().unwrap();
    }

    let opener = ReplayOpener::new(&path);
    let request = OpenRequest::any(1, DeviceKind::Davis);
    let mut acquisition =
        Acquisition::open(&opener, &request, AcquisitionConfig::default()).unwrap();
    assert!(acquisition.descriptor().dvs.is_empty());
    assert_eq!(acquisition.descriptor().device_string, "DVXplorer");

    let batches = acquisition.next_tick().unwrap();
    assert_eq!(batches.polarity, vec![event]);
    assert!(batches.rejected.is_empty());
}

#[test]
fn test_replay_wrong_kind_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dvs.aedat");
    let mut writer = AedatWriter::create(&path).unwrap();
    writer.write_header("DVS128").unwrap();
    writer.flush().unwrap();

    let opener = ReplayOpener::new(&path);
    let request = OpenRequest::any(1, DeviceKind::Dynapse);
    assert!(matches!(
        Acquisition::open(&opener, &request, AcquisitionConfig::default()),
        Err(AcquisitionError::DeviceNotFound(_))
    ));

    let missing = ReplayOpener::new(dir.path().join("missing.aedat"));
    assert!(matches!(
        missing.open(&OpenRequest::any(1, DeviceKind::Dvs128)),
        Err(DeviceError::NotFound(_))
    ));
}

#[test]
fn test_csv_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.csv");
    {
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = output::PolarityCsvWriter::new(file, FieldOrder::TXYP);
        writer.write_header(None).unwrap();
        writer
            .write_events(&[PolarityEvent::new(5, 1, 2, false)])
            .unwrap();
        writer.flush().unwrap();
    }
    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content, "timestamp,x,y,polarity\n5,1,2,0\n");
}

proptest! {
    /// A polarity sub-packet is accepted exactly when every event lies
    /// inside the DVS array.
    #[test]
    fn prop_polarity_bounds(
        width in 1u16..400,
        height in 1u16..300,
        coords in prop::collection::vec((0u16..450, 0u16..350), 1..20),
    ) {
        let events: Vec<_> = coords
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| PolarityEvent::new(i as i32, x, y, i % 2 == 0))
            .collect();
        let container: EventPacketContainer =
            std::iter::once(polarity_packet(&events)).collect();

        let descriptor = DeviceDescriptor::davis(1, "", Geometry::new(width, height));
        let batches = PacketDecoder::new(&descriptor, Default::default())
            .decode_container(container);

        let in_bounds = coords.iter().all(|&(x, y)| x < width && y < height);
        if in_bounds {
            prop_assert_eq!(&batches.polarity, &events);
            prop_assert!(batches.rejected.is_empty());
        } else {
            prop_assert!(batches.polarity.is_empty());
            prop_assert_eq!(batches.rejected.len(), 1);
        }
        for event in &batches.polarity {
            prop_assert!(event.x < width && event.y < height);
        }
    }
}
