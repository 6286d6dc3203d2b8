//! Network event loops wiring `tsb::{InputBuilder, ComputeBuilder}` to a
//! `tsb_transport::TcpTransport`.
//!
//! This is the glue layer `tsb_transport::transport`'s module docs refer to:
//! the core only knows about one-sided writes and tagged messages by
//! `wr_id`; something has to decide what those bytes mean (content vs.
//! component descriptor, status vs. heartbeat) and where they land. That
//! something lives here, outside the core crate.
//!
//! ## Application framing
//! `TcpTransport::poll_recv` delivers both one-sided writes and tagged sends
//! through the same callback, and a write's payload carries an 8-byte
//! `dst_offset` the transport itself prepends (see
//! `tsb_transport::transport`'s module docs) while a tagged send's payload
//! does not. To let one decoder handle both without guessing, every tagged
//! send built here pads itself with 8 leading zero bytes so an [`AppKind`]
//! byte always lands at the same offset (8) regardless of which kind of
//! transport call carried it:
//!
//! ```text
//! write:  [dst_offset: u64 LE][kind: u8][payload]
//! tagged: [0u8; 8]            [kind: u8][payload]
//! ```
//!
//! Polling is a single-threaded loop rather than a four-thread model split
//! across CM-events, completions, timers and workers: `tsb-cli` is a
//! reference harness for exercising the core over TCP, not a production
//! RDMA deployment.

use std::{collections::HashMap, path::PathBuf, time::Duration as StdDuration};

use shared_memory::{Shmem, ShmemConf, ShmemError};
use tsb::{
    compute_builder::ComputeBuilder,
    distributor::ItemDistributor,
    error::BuilderError,
    heartbeat::{FailureConsensus, HeartbeatLayer},
    input_builder::{InputBuilder, InputSendEvent},
    source::{SyntheticSource, TimesliceSource},
    transport::{ConnectEvent, RequestKind, Transport, TransportCompletion, WrId},
    wire::{
        ComputeNodeInfo, ComputeNodeStatusMessage, HeartbeatMessage, InputChannelStatusMessage,
        InputNodeInfo, RemoteMemoryRegion, TimesliceComponentDescriptor,
    },
};
use tsb_timing::{Duration, Nanos, Repeater};
use tsb_transport::TcpTransport;

use crate::{
    config::{ComputeArgs, InputArgs},
    processor::ProcessorPool,
};

/// Single tag byte disambiguating every application-level frame this crate
/// exchanges, whether it rode in on a one-sided write or a tagged send (see
/// the module docs for why both land at the same byte offset).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum AppKind {
    Content = 0,
    ComponentDescriptor = 1,
    InputStatus = 2,
    ComputeStatus = 3,
    Heartbeat = 4,
    /// Compute -> input, sent once right after accept: plain TCP's connect
    /// handshake only carries `InputNodeInfo` one way (there is no remote key
    /// to hand back through `Transport::listen`), so the negotiated
    /// `ComputeNodeInfo` travels as a regular tagged message instead.
    ComputeHello = 5,
}

/// A dynamically-sized byte region backed by `shared_memory`, the same
/// create-or-open/`flink` pattern as `tsb_communication::ShmemData<T>` but
/// sized at runtime: a compute node's data/desc buffers are `1 <<
/// size_exp` bytes, a size no fixed `T` can express.
struct ByteRegion {
    _shmem: Shmem,
    ptr: *mut u8,
    len: usize,
}

// SAFETY: a `ByteRegion` is only ever touched from the single thread running
// this module's event loop; the raw pointer is never aliased across threads.
unsafe impl Send for ByteRegion {}

impl ByteRegion {
    fn create_or_open(app_name: &str, name: &str, len: usize) -> Self {
        let path: PathBuf = tsb_utils::directories::shmem_dir_data(app_name).join(name);
        std::fs::create_dir_all(path.parent().expect("shmem path always has a parent"))
            .expect("failed to create shmem data directory");
        let shmem = match ShmemConf::new().size(len).flink(&path).create() {
            Ok(s) => s,
            Err(ShmemError::LinkExists) => ShmemConf::new()
                .flink(&path)
                .open()
                .unwrap_or_else(|_| panic!("couldn't open shmem region {}", path.display())),
            Err(e) => panic!("couldn't create shmem region {}: {e}", path.display()),
        };
        let ptr = shmem.as_ptr();
        Self { _shmem: shmem, ptr, len }
    }

    fn write_at(&self, offset: u64, data: &[u8]) {
        let start = (offset % self.len as u64) as usize;
        let end = start + data.len();
        assert!(end <= self.len, "shmem region write out of bounds");
        // SAFETY: `start..end` was just checked to fit within `self.len`, and
        // per the struct's `Send` note no other thread reaches this pointer.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len)[start..end].copy_from_slice(data) };
    }
}

fn app_name_for(role: &str, index: u32) -> String {
    format!("tsb-{role}-{index}")
}

fn encode_write_frame(kind: AppKind, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(data.len() + 1);
    payload.push(kind as u8);
    payload.extend_from_slice(data);
    payload
}

fn encode_tagged_frame(kind: AppKind, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(body.len() + 9);
    payload.extend_from_slice(&[0_u8; 8]);
    payload.push(kind as u8);
    payload.extend_from_slice(body);
    payload
}

/// Splits a received payload (from either a write or a tagged send, per the
/// module docs) into its real `dst_offset` (meaningful only for writes), its
/// [`AppKind`] byte, and the remaining body.
fn decode_frame(payload: &[u8]) -> Option<(u64, u8, &[u8])> {
    if payload.len() < 9 {
        return None;
    }
    let dst_offset = u64::from_le_bytes(payload[0..8].try_into().ok()?);
    Some((dst_offset, payload[8], &payload[9..]))
}

fn post_write_app(
    transport: &mut TcpTransport,
    channel: usize,
    ts: u64,
    request_kind: RequestKind,
    app_kind: AppKind,
    dst_offset: u64,
    data: &[u8],
    fence: bool,
) -> Result<(), BuilderError> {
    let wr_id = WrId::encode(ts, channel as u32, request_kind);
    let payload = encode_write_frame(app_kind, data);
    transport.post_write(channel, wr_id, dst_offset, &payload, fence)
}

fn send_tagged(
    transport: &mut TcpTransport,
    channel: usize,
    kind: AppKind,
    body: &[u8],
) -> Result<(), BuilderError> {
    let request_kind =
        if kind == AppKind::Heartbeat { RequestKind::HeartbeatSend } else { RequestKind::SendStatus };
    let wr_id = WrId::encode(0, channel as u32, request_kind);
    let payload = encode_tagged_frame(kind, body);
    transport.post_tagged_send(channel, wr_id, &payload)
}

/// Drives one input node until every channel finishes its finalize
/// handshake or `running` goes false.
pub fn run_input(args: InputArgs, running: impl Fn() -> bool) -> Result<(), BuilderError> {
    let num_out = args.compute_addrs.len();
    let source =
        SyntheticSource::new(args.desc_buffer_size_exp, args.data_buffer_size_exp, args.microslice_size, None);
    let mut builder = InputBuilder::new(
        num_out,
        args.data_buffer_size_exp,
        args.desc_buffer_size_exp,
        args.max_pending_writes,
        args.desc_buffer_size_exp,
        args.timeslice_size,
        args.overlap,
        args.max_timeslices,
        source,
    );

    let mut transport = TcpTransport::new();
    for (out_index, addr) in args.compute_addrs.iter().enumerate() {
        let channel = transport.connect(*addr, &InputNodeInfo { index: args.index }.to_bytes())?;
        tracing::info!(out_index, channel, %addr, "connecting to compute node");
    }

    let mut heartbeat = HeartbeatLayer::new(args.index, num_out, args.heartbeat.to_config(), Nanos::now());
    let mut heartbeat_tick = Repeater::every(Duration::from_millis(args.heartbeat.heartbeat_interval_ms));
    // Destinations this node has already broadcast a failure report for;
    // avoids re-reporting every heartbeat tick once one is sent.
    let mut reported_failed: std::collections::HashSet<usize> = std::collections::HashSet::new();

    let mut ts: u64 = 0;
    while running() && !builder.is_done() {
        if builder.should_finalize(ts) {
            builder.request_finalize(false);
        } else {
            match builder.maybe_send(ts) {
                Ok(Some(event)) => {
                    emit_timeslice_writes(&mut transport, &builder, &event)?;
                    ts += 1;
                }
                Ok(None) => builder.run_scheduler(),
                Err(err) => return Err(err),
            }
        }

        drain_connect_events_input(&mut transport);
        drain_completions_input(&mut transport, &mut builder);
        drain_recv_input(&mut transport, &mut builder, &mut heartbeat);

        // Newly-timed-out destinations: broadcast a failure report to every
        // other surviving destination so their compute nodes can reach
        // consensus (§4.7), then redistribute this node's own future sends.
        for out_index in 0..num_out {
            if heartbeat.is_timed_out(out_index) && reported_failed.insert(out_index) {
                let report = builder.failure_report(out_index, ts);
                tracing::warn!(out_index, ?report, "reporting destination compute node as timed out");
                for peer in 0..num_out {
                    if peer != out_index && !reported_failed.contains(&peer) {
                        let probe = heartbeat.send_probe_with_failure(peer, Some(report));
                        let _ = send_tagged(&mut transport, peer, AppKind::Heartbeat, &probe.to_bytes());
                    }
                }
                builder.mark_channel_failed(out_index);
            }
        }

        for (channel, wp) in builder.drain_pending_status() {
            let msg = InputChannelStatusMessage {
                wp,
                abort: builder.channel(channel).abort,
                is_final: builder.channel(channel).should_send_final(),
                connect: false,
                info: InputNodeInfo { index: args.index },
            };
            send_tagged(&mut transport, channel, AppKind::InputStatus, &msg.to_bytes())?;
        }

        builder.sync_source_if_due();

        if heartbeat_tick.fired() {
            for out_index in 0..num_out {
                let probe = heartbeat.send_probe(out_index);
                send_tagged(&mut transport, out_index, AppKind::Heartbeat, &probe.to_bytes())?;
            }
            heartbeat.classify_all(Nanos::now());
            for out_index in 0..num_out {
                if heartbeat.is_timed_out(out_index) {
                    tracing::warn!(out_index, "compute node heartbeat timed out");
                }
            }
        }

        std::thread::sleep(StdDuration::from_micros(200));
    }
    tracing::info!(sent = builder.sent_desc(), "input node finished");
    Ok(())
}

fn emit_timeslice_writes<S: TimesliceSource>(
    transport: &mut TcpTransport,
    builder: &InputBuilder<S>,
    event: &InputSendEvent,
) -> Result<(), BuilderError> {
    let channel = event.channel;
    let source = builder.source();
    for seg in &event.plan.desc_block_segments {
        let bytes = content_segment_bytes(source, seg.src_offset, seg.len);
        post_write_app(
            transport,
            channel,
            event.ts_pos,
            RequestKind::WriteData,
            AppKind::Content,
            seg.dst_offset,
            &bytes,
            false,
        )?;
    }
    for seg in &event.plan.content_segments {
        let bytes = content_segment_bytes(source, seg.src_offset, seg.len);
        post_write_app(
            transport,
            channel,
            event.ts_pos,
            RequestKind::WriteData,
            AppKind::Content,
            seg.dst_offset,
            &bytes,
            false,
        )?;
    }
    let desc_bytes = event.plan.component_descriptor.to_bytes();
    post_write_app(
        transport,
        channel,
        event.ts_pos,
        RequestKind::WriteDesc,
        AppKind::ComponentDescriptor,
        event.plan.component_desc_slot * TimesliceComponentDescriptor::WIRE_SIZE as u64,
        &desc_bytes,
        true,
    )
}

fn content_segment_bytes<S: TimesliceSource>(source: &S, src_offset: u64, len: u64) -> Vec<u8> {
    (0..len).map(|i| *source.data_buffer().at(src_offset + i)).collect()
}

fn drain_connect_events_input(transport: &mut TcpTransport) {
    let mut events = Vec::new();
    transport.poll_connect_events(&mut |ev| events.push(ev));
    for ev in events {
        match ev {
            ConnectEvent::Established { channel, .. } => {
                tracing::info!(channel, "compute node connection established");
            }
            ConnectEvent::Disconnected { channel } => {
                tracing::warn!(channel, "compute connection dropped");
            }
            other => tracing::warn!(?other, "connect event"),
        }
    }
}

fn drain_completions_input<S: TimesliceSource>(transport: &mut TcpTransport, builder: &mut InputBuilder<S>) {
    let mut completions: Vec<TransportCompletion> = Vec::new();
    transport.poll_completions(&mut |c| completions.push(c));
    for c in completions {
        if c.wr_id.kind() == Some(RequestKind::WriteDesc) {
            builder.on_write_complete(c.wr_id.channel_index() as usize, c.wr_id.timeslice());
        }
    }
}

fn drain_recv_input<S: TimesliceSource>(
    transport: &mut TcpTransport,
    builder: &mut InputBuilder<S>,
    heartbeat: &mut HeartbeatLayer,
) {
    let mut recvs: Vec<(usize, Vec<u8>)> = Vec::new();
    transport.poll_recv(&mut |channel, payload| recvs.push((channel, payload.to_vec())));
    for (channel, payload) in recvs {
        let Some((_, kind, body)) = decode_frame(&payload) else { continue };
        match kind {
            k if k == AppKind::ComputeStatus as u8 => {
                if let Some(msg) = ComputeNodeStatusMessage::from_bytes(body) {
                    builder.on_status_recv(channel, &msg);
                }
            }
            k if k == AppKind::ComputeHello as u8 => {
                if let Some(info) = ComputeNodeInfo::from_bytes(body) {
                    builder.on_channel_connected(channel, info);
                }
            }
            k if k == AppKind::Heartbeat as u8 => {
                if let Some(msg) = HeartbeatMessage::from_bytes(body) {
                    if let Some(reply) = heartbeat.on_recv(channel, &msg, Nanos::now()) {
                        let _ = send_tagged(transport, channel, AppKind::Heartbeat, &reply.to_bytes());
                    }
                    // A compute node that reached consensus on a failed peer
                    // delivers the decision back over any still-live channel;
                    // apply it here regardless of which channel it arrived on.
                    if let Some(decision) = msg.failure_info {
                        builder.mark_channel_failed(decision.index as usize);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Per-connected-input bookkeeping a compute node needs beyond what
/// `ComputeBuilder` tracks itself: the shared-memory regions workers read
/// from, and the mapping from transport channel (assigned in accept order)
/// to logical input index (the `InputNodeInfo.index` the input announced).
struct ComputeChannelIo {
    logical_index: u32,
    data: ByteRegion,
    desc: ByteRegion,
}

/// Drives one compute node until interrupted. Accepts `num_input_nodes`
/// connections, assembles timeslices via the red-lantern algorithm, and
/// (unless `--drop`) hands them to a local worker pool through shared
/// memory.
pub fn run_compute(args: ComputeArgs, running: impl Fn() -> bool) -> Result<(), BuilderError> {
    let app_name = app_name_for("compute", args.index);
    let distributor = if args.drop {
        ItemDistributor::dropped()
    } else {
        ItemDistributor::shared(&app_name, 1_usize << args.desc_buffer_size_exp)
    };

    let _processor_pool = if args.drop {
        None
    } else if let Some(template) = &args.processor_executable {
        Some(
            ProcessorPool::spawn(template, &app_name, args.num_workers)
                .map_err(|e| BuilderError::AllocationFailed { reason: e.to_string() })?,
        )
    } else {
        None
    };

    let mut builder = ComputeBuilder::new(
        args.num_input_nodes,
        args.data_buffer_size_exp,
        args.desc_buffer_size_exp,
        args.desc_buffer_size_exp,
        distributor,
    );

    let mut transport = TcpTransport::new();
    transport.listen(args.listen_addr)?;
    tracing::info!(addr = %args.listen_addr, index = args.index, "compute node listening");

    let mut channel_io: HashMap<usize, ComputeChannelIo> = HashMap::new();
    let mut heartbeat =
        HeartbeatLayer::new(args.index, args.num_input_nodes, args.heartbeat.to_config(), Nanos::now());
    let mut consensus = FailureConsensus::new();
    let mut heartbeat_tick = Repeater::every(Duration::from_millis(args.heartbeat.heartbeat_interval_ms));

    let own_hello = |index: u32| ComputeNodeInfo {
        data: RemoteMemoryRegion::default(),
        desc: RemoteMemoryRegion::default(),
        index,
        data_buffer_size_exp: args.data_buffer_size_exp,
        desc_buffer_size_exp: args.desc_buffer_size_exp,
    };

    while running() && !builder.is_done() {
        let mut connect_events = Vec::new();
        transport.poll_connect_events(&mut |ev| connect_events.push(ev));
        for ev in connect_events {
            match ev {
                ConnectEvent::Established { channel, private_data } => {
                    let Some(info) = InputNodeInfo::from_bytes(&private_data) else { continue };
                    builder.on_channel_connected(info.index as usize, info);

                    let data_len = (1_u64 << args.data_buffer_size_exp) as usize;
                    let desc_len =
                        (1_u64 << args.desc_buffer_size_exp) as usize * TimesliceComponentDescriptor::WIRE_SIZE;
                    let data = ByteRegion::create_or_open(&app_name, &format!("data_{}", info.index), data_len);
                    let desc = ByteRegion::create_or_open(&app_name, &format!("desc_{}", info.index), desc_len);
                    channel_io.insert(channel, ComputeChannelIo { logical_index: info.index, data, desc });

                    let _ = send_tagged(
                        &mut transport,
                        channel,
                        AppKind::ComputeHello,
                        &own_hello(args.index).to_bytes(),
                    );
                    tracing::info!(channel, input_index = info.index, "input node connected");
                }
                ConnectEvent::Disconnected { channel } => {
                    if let Some(io) = channel_io.remove(&channel) {
                        builder.mark_channel_failed(io.logical_index as usize, None);
                        heartbeat.mark_failed(io.logical_index as usize);
                        tracing::warn!(channel, input = io.logical_index, "input connection dropped");
                    }
                }
                other => tracing::warn!(?other, "connect event"),
            }
        }

        let mut recvs: Vec<(usize, Vec<u8>)> = Vec::new();
        transport.poll_recv(&mut |channel, payload| recvs.push((channel, payload.to_vec())));
        for (channel, payload) in recvs {
            handle_compute_recv(
                &mut transport,
                &mut builder,
                &mut heartbeat,
                &mut consensus,
                &channel_io,
                channel,
                &payload,
                args.num_input_nodes,
                args.index,
            );
        }

        // One-sided writes into this node's own shared memory need no local
        // write-completion callback (unlike the input side, which tracks
        // `pending_writes`); drain the queue so it does not grow unbounded.
        transport.poll_completions(&mut |_| {});

        builder.poll_completions();
        for (logical_index, ack) in builder.drain_pending_acks() {
            if let Some((&channel, _)) =
                channel_io.iter().find(|(_, io)| io.logical_index as usize == logical_index)
            {
                let msg = ComputeNodeStatusMessage {
                    ack,
                    request_abort: false,
                    is_final: false,
                    connect: false,
                    info: own_hello(args.index),
                };
                let _ = send_tagged(&mut transport, channel, AppKind::ComputeStatus, &msg.to_bytes());
            }
        }

        for (logical_index, ack) in builder.drain_final_acks() {
            if let Some((&channel, _)) =
                channel_io.iter().find(|(_, io)| io.logical_index as usize == logical_index)
            {
                let msg = ComputeNodeStatusMessage {
                    ack,
                    request_abort: false,
                    is_final: true,
                    connect: false,
                    info: own_hello(args.index),
                };
                let _ = send_tagged(&mut transport, channel, AppKind::ComputeStatus, &msg.to_bytes());
                tracing::info!(logical_index, "sent final status, channel done");
            }
        }

        if heartbeat_tick.fired() {
            for (&channel, io) in &channel_io {
                let probe = heartbeat.send_probe(io.logical_index as usize);
                let _ = send_tagged(&mut transport, channel, AppKind::Heartbeat, &probe.to_bytes());
            }
            heartbeat.classify_all(Nanos::now());
            for io in channel_io.values() {
                if heartbeat.is_timed_out(io.logical_index as usize) {
                    tracing::warn!(input = io.logical_index, "input node heartbeat timed out");
                }
            }
        }

        std::thread::sleep(StdDuration::from_micros(200));
    }
    Ok(())
}

fn handle_compute_recv(
    transport: &mut TcpTransport,
    builder: &mut ComputeBuilder,
    heartbeat: &mut HeartbeatLayer,
    consensus: &mut FailureConsensus,
    channel_io: &HashMap<usize, ComputeChannelIo>,
    channel: usize,
    payload: &[u8],
    num_input_nodes: usize,
    own_index: u32,
) {
    let Some((dst_offset, kind, body)) = decode_frame(payload) else { return };

    if kind == AppKind::Content as u8 || kind == AppKind::ComponentDescriptor as u8 {
        let Some(io) = channel_io.get(&channel) else { return };
        if kind == AppKind::Content as u8 {
            io.data.write_at(dst_offset, body);
        } else if let Some(descriptor) = TimesliceComponentDescriptor::from_bytes(body) {
            let slot = dst_offset / TimesliceComponentDescriptor::WIRE_SIZE as u64;
            builder.record_component_descriptor(io.logical_index as usize, slot, descriptor);
            io.desc.write_at(dst_offset, body);
        }
        return;
    }

    if kind == AppKind::InputStatus as u8 {
        if let Some(msg) = InputChannelStatusMessage::from_bytes(body) {
            let _ = builder.on_wp_recv(msg.info.index as usize, &msg);
        }
        return;
    }

    if kind == AppKind::Heartbeat as u8 {
        if let Some(msg) = HeartbeatMessage::from_bytes(body) {
            if let Some(io) = channel_io.get(&channel) {
                if let Some(reply) = heartbeat.on_recv(io.logical_index as usize, &msg, Nanos::now()) {
                    let _ = send_tagged(transport, channel, AppKind::Heartbeat, &reply.to_bytes());
                }
                if let Some(info) = msg.failure_info {
                    if let Some(decision) = consensus.record_report(info, num_input_nodes) {
                        builder.mark_channel_failed(decision.index as usize, Some(decision.timeslice_trigger));
                        // Deliver the consensus decision back to every
                        // connected input node so each can mark its own
                        // channel failed and redistribute (§4.7).
                        for &peer_channel in channel_io.keys() {
                            let decision_msg = HeartbeatMessage {
                                sender_index: own_index,
                                message_id: 0,
                                ack: true,
                                failure_info: Some(decision),
                            };
                            let _ = send_tagged(transport, peer_channel, AppKind::Heartbeat, &decision_msg.to_bytes());
                        }
                    }
                }
            }
        }
    }
}

/// Installs a Ctrl-C handler and returns a flag that flips to `false` once it
/// fires, for the two run loops' `running` predicate.
#[must_use]
pub fn install_ctrlc_flag() -> std::sync::Arc<std::sync::atomic::AtomicBool> {
    let running = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        flag.store(false, std::sync::atomic::Ordering::SeqCst);
    })
    .expect("failed to install Ctrl-C handler");
    running
}
