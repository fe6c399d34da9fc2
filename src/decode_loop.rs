//! The producer/reaper pipeline: reads an Annex-B byte stream, segments and
//! parses it, submits each picture to the kernel through a request, and
//! reaps decoded frames on a dedicated thread.

use crate::buffers::{CodedPool, DecodedPool};
use crate::control::{
    V4l2CtrlH264DecodeParams, V4l2CtrlH264Pps, V4l2CtrlH264Sps, V4l2CtrlH264SliceParams,
    CID_STATELESS_H264_DECODE_PARAMS, CID_STATELESS_H264_PPS, CID_STATELESS_H264_SLICE_PARAMS,
    CID_STATELESS_H264_SPS,
};
use crate::dpb::Dpb;
use crate::error::{DecoderError, DecoderStreamException};
use crate::ioctl::ExtControl;
use crate::nal::{Nal, NalUnitType};
use crate::params::{Pps, Sps};
use crate::request::RequestPool;
use crate::segmenter::{self, SegmenterMode};
use crate::sharing::FrameConsumer;
use crate::stream::StreamState;
use std::io::Read;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const CHUNK_SIZE: usize = 16 * 1024;
const REAPER_POLL_TIMEOUT_MS: i32 = 1000;
const DRAIN_POLL_MS: i32 = 1;
/// Depth of the bounded NAL-unit channel between the stream reader thread and
/// the parse/submit loop; the reader blocks once this many parsed units are
/// queued and the consumer hasn't kept up.
const NAL_CHANNEL_CAPACITY: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct DecodeStats {
    pub frames_decoded: u64,
}

/// Owns every queue/pool a stateless decode needs and runs the producer
/// pipeline to completion, reaping decoded frames concurrently.
pub struct DecodeLoop {
    video_fd: RawFd,
    coded: CodedPool,
    decoded: DecodedPool,
    requests: RequestPool,
    stream_state: StreamState,
    dpb: Option<Dpb>,
    cancel: Arc<AtomicBool>,
    decoded_frames: Arc<AtomicU64>,
    drain_idle_budget_ms: u64,
}

impl DecodeLoop {
    pub fn new(video_fd: RawFd, coded: CodedPool, decoded: DecodedPool, requests: RequestPool) -> Self {
        Self::with_drain_idle_budget(video_fd, coded, decoded, requests, crate::config::Config::default().drain_idle_budget_ms)
    }

    /// Like [`Self::new`], but with an explicit idle-drain budget (in
    /// milliseconds) instead of the config default — the time the reaper
    /// keeps polling after the producer finishes before concluding no more
    /// frames are coming.
    pub fn with_drain_idle_budget(
        video_fd: RawFd,
        coded: CodedPool,
        decoded: DecodedPool,
        requests: RequestPool,
        drain_idle_budget_ms: u64,
    ) -> Self {
        DecodeLoop {
            video_fd,
            coded,
            decoded,
            requests,
            stream_state: StreamState::new(),
            dpb: None,
            cancel: Arc::new(AtomicBool::new(false)),
            decoded_frames: Arc::new(AtomicU64::new(0)),
            drain_idle_budget_ms,
        }
    }

    /// Shared flag the caller can set to request shutdown; honored at NAL
    /// and reaper-poll granularity.
    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Drives the producer from `input` to completion while a reaper thread
    /// drains decoded output into `consumer`, and returns once both the
    /// input is exhausted and the drain phase has gone idle.
    pub fn run<R: Read + Send + 'static>(
        mut self,
        mut input: R,
        consumer: Box<dyn FrameConsumer>,
    ) -> Result<DecodeStats, DecoderError> {
        self.decoded.enqueue_all()?;

        let producer_done = Arc::new(AtomicBool::new(false));
        let drain_idle_rounds = (self.drain_idle_budget_ms / DRAIN_POLL_MS as u64).max(1) as u32;
        let reaper = {
            let decoded = self.decoded;
            let cancel = self.cancel.clone();
            let producer_done = producer_done.clone();
            let decoded_frames = self.decoded_frames.clone();
            std::thread::spawn(move || {
                reaper_loop(decoded, cancel, producer_done, decoded_frames, consumer, drain_idle_rounds)
            })
        };

        // The reader thread owns the byte stream and the segmenter's
        // producer half; this thread is the bounded channel's sole
        // consumer, parsing and submitting each unit as it arrives.
        let (mut nal_producer, nal_consumer) = segmenter::channel(SegmenterMode::WithStartCode, NAL_CHANNEL_CAPACITY);
        let read_error: Arc<Mutex<Option<std::io::Error>>> = Arc::new(Mutex::new(None));
        let reader_cancel = self.cancel.clone();
        let reader_error = read_error.clone();
        let reader = std::thread::spawn(move || {
            let mut chunk = vec![0u8; CHUNK_SIZE];
            loop {
                if reader_cancel.load(Ordering::Relaxed) {
                    break;
                }
                match input.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => nal_producer.append(&chunk[..n]),
                    Err(e) => {
                        *reader_error.lock().unwrap() = Some(e);
                        break;
                    }
                }
            }
            nal_producer.complete();
        });

        let mut frames_submitted = 0u64;
        let mut stream_error: Option<DecoderError> = None;

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            let unit = match nal_consumer.next_unit() {
                Some(unit) => unit,
                None => break,
            };
            match self.submit_unit(&unit, &mut frames_submitted) {
                Ok(()) => {}
                Err(DecoderError::DecoderStream(ex)) => {
                    stream_error = Some(DecoderError::DecoderStream(ex));
                    break;
                }
                Err(e) => {
                    tracing::warn!("dropping NAL unit: {e}");
                }
            }
        }

        // Drop the consumer before joining: if we stopped early (cancel or a
        // stream error) the reader may be parked sending into a full
        // channel, and dropping the receiver is what unparks it.
        drop(nal_consumer);
        let _ = reader.join();
        if let Some(e) = read_error.lock().unwrap().take() {
            if stream_error.is_none() {
                stream_error = Some(DecoderError::Io(e));
            }
        }

        producer_done.store(true, Ordering::Release);
        let reaper_result = reaper.join().unwrap_or(Ok(()));

        if let Some(e) = stream_error {
            return Err(e);
        }
        reaper_result?;

        Ok(DecodeStats {
            frames_decoded: self.decoded_frames.load(Ordering::Acquire),
        })
    }

    /// Parses one segmenter-emitted unit (start code included) and, for
    /// SPS/PPS, updates stream state; for a full picture's slice, submits it.
    fn submit_unit(&mut self, unit: &[u8], frames_submitted: &mut u64) -> Result<(), DecoderError> {
        let sc_len = start_code_len(unit);
        let nal = Nal::parse(&unit[sc_len..]).map_err(|e| DecoderError::Misuse(nal_parse_failure_reason(e)))?;
        let rbsp = nal.to_rbsp();

        match nal.nal_type {
            NalUnitType::Sps => {
                let sps = Sps::parse(&rbsp).map_err(|_| DecoderError::Misuse("sps parse failed"))?;
                self.dpb = Some(Dpb::new(sps.max_num_ref_frames));
                self.stream_state.store_sps(sps);
                Ok(())
            }
            NalUnitType::Pps => {
                let sps_id = crate::params::pps::peek_seq_parameter_set_id(&rbsp).unwrap_or(0);
                let sps = self
                    .stream_state
                    .sps(sps_id)
                    .map_err(|_| DecoderError::Misuse("pps references unknown sps"))?;
                let pps = Pps::parse(&rbsp, &sps).map_err(|_| DecoderError::Misuse("pps parse failed"))?;
                self.stream_state.store_pps(pps);
                Ok(())
            }
            NalUnitType::IdrSlice | NalUnitType::NonIdrSlice => {
                self.submit_slice(&nal, &rbsp, unit, frames_submitted)
            }
            _ => Ok(()),
        }
    }

    fn submit_slice(
        &mut self,
        nal: &Nal,
        rbsp: &[u8],
        unit_with_start_code: &[u8],
        frames_submitted: &mut u64,
    ) -> Result<(), DecoderError> {
        let is_idr = nal.nal_type == NalUnitType::IdrSlice;

        // Peek pic_parameter_set_id without committing to a full header
        // parse yet, so an unknown pps/sps just drops the slice.
        let pps_id = match crate::params::slice::peek_pic_parameter_set_id(rbsp) {
            Some(id) => id,
            None => return Ok(()),
        };
        let (pps, sps) = match self.stream_state.resolve_pps_chain(pps_id) {
            Ok(pair) => pair,
            Err(_) => return Ok(()),
        };

        let header = crate::params::slice::SliceHeader::parse(rbsp, nal.ref_idc, nal.nal_type, &sps, &pps)
            .map_err(|_| DecoderError::Misuse("slice header parse failed"))?;

        if header.first_mb_in_slice != 0 {
            // Frame-based mode expects one whole picture per buffer; a
            // trailing slice of an already-submitted picture is skipped.
            return Ok(());
        }

        if is_idr {
            if let Some(dpb) = &mut self.dpb {
                dpb.clear_on_idr(header.dec_ref_pic_marking.no_output_of_prior_pics_flag);
            }
        }

        self.coded.ensure_free()?;
        let slot = self.requests.acquire()?;
        let request_fd = self.requests.fd(slot);

        let dpb_snapshot = self
            .dpb
            .as_ref()
            .map(|d| d.snapshot())
            .unwrap_or_else(|| [Default::default(); crate::control::V4L2_H264_NUM_DPB_ENTRIES]);

        let mut sps_ctrl = V4l2CtrlH264Sps::from(sps.as_ref());
        let mut pps_ctrl = V4l2CtrlH264Pps::from(pps.as_ref());
        let mut slice_ctrl = V4l2CtrlH264SliceParams::from_header(&header, header.header_bit_size);
        let mut decode_ctrl = V4l2CtrlH264DecodeParams::build(&header, nal.ref_idc, is_idr, dpb_snapshot);

        let mut controls = [
            ExtControl::from_payload(CID_STATELESS_H264_SPS, &mut sps_ctrl),
            ExtControl::from_payload(CID_STATELESS_H264_PPS, &mut pps_ctrl),
            ExtControl::from_payload(CID_STATELESS_H264_SLICE_PARAMS, &mut slice_ctrl),
            ExtControl::from_payload(CID_STATELESS_H264_DECODE_PARAMS, &mut decode_ctrl),
        ];

        let submit_result = (|| -> Result<(), DecoderError> {
            self.requests.set_controls(self.video_fd, slot, &mut controls)?;
            self.coded.write_and_queue(unit_with_start_code, Some(request_fd))?;
            self.requests.submit(slot)?;
            Ok(())
        })();

        match submit_result {
            Ok(()) => {
                if nal.ref_idc > 0 {
                    if let Some(dpb) = &mut self.dpb {
                        dpb.push_reference(header.frame_num, header.pic_order_cnt_lsb);
                    }
                }
                *frames_submitted += 1;
                Ok(())
            }
            Err(e) => {
                tracing::error!("request submission failed, treating as stream failure: {e}");
                let _ = self.requests.reinit(slot);
                Err(DecoderError::DecoderStream(DecoderStreamException {
                    code: -1,
                    frames_decoded: *frames_submitted,
                }))
            }
        }
    }
}

fn reaper_loop(
    mut decoded: DecodedPool,
    cancel: Arc<AtomicBool>,
    producer_done: Arc<AtomicBool>,
    decoded_frames: Arc<AtomicU64>,
    mut consumer: Box<dyn FrameConsumer>,
    drain_idle_rounds: u32,
) -> Result<(), DecoderError> {
    let mut idle_rounds = 0u32;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Ok(());
        }
        let done = producer_done.load(Ordering::Relaxed);
        let poll_ms = if done { DRAIN_POLL_MS } else { REAPER_POLL_TIMEOUT_MS };

        match decoded.wait_ready(poll_ms, &cancel)? {
            Some(slot) => {
                decoded_frames.fetch_add(1, Ordering::Relaxed);
                idle_rounds = 0;
                consumer.on_ready(slot, &mut decoded);
            }
            None if done => {
                idle_rounds += 1;
                if idle_rounds >= drain_idle_rounds {
                    return Ok(());
                }
            }
            None => {}
        }
    }
}

fn start_code_len(unit: &[u8]) -> usize {
    if unit.len() >= 4 && unit[0] == 0 && unit[1] == 0 && unit[2] == 0 && unit[3] == 1 {
        4
    } else {
        3
    }
}

fn nal_parse_failure_reason(_e: crate::nal::NalError) -> &'static str {
    "nal header parse failed"
}
