//! `HardwareBridge`: the vendor driver contract, and `DaqController`, the
//! polling duplex driver built on top of it.
//!
//! Two distinct things are kept apart here: [`HardwareBridge`] is the trait
//! every vendor driver must satisfy (open/close/preload/readWrite/etc, plus
//! status flags and the canonical clock). [`DaqController`] is the state
//! machine and acquisition-thread owner that drives a `Box<dyn
//! HardwareBridge>` through preload/run/stop/fault. It knows nothing about
//! `Epoch`/`ExternalDevice` — per-stream block shuttling is supplied to it
//! as plain closures (see [`OutputPuller`]/[`InputPusher`]), which is how
//! this crate avoids the owning-cycle a `Stream` holding a live `&Device`
//! would create.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;

use crate::error::{SymphonyError, SymphonyResult};
use crate::events::{Event, EventBus};
use crate::iodata::{IOData, TimeSpan};
use crate::measurement::registry::UnitRegistry;
use crate::measurement::Measurement;

/// The six channel kinds a bridge can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    /// Analog output to the hardware.
    AnalogOut,
    /// Analog input from the hardware.
    AnalogIn,
    /// Digital output to the hardware.
    DigitalOut,
    /// Digital input from the hardware.
    DigitalIn,
    /// Auxiliary output (e.g. telegraph command).
    AuxOut,
    /// Auxiliary input (e.g. telegraph readback).
    AuxIn,
}

impl ChannelType {
    /// `true` for the three *-Out variants.
    pub fn is_output(self) -> bool {
        matches!(self, ChannelType::AnalogOut | ChannelType::DigitalOut | ChannelType::AuxOut)
    }
}

/// `(channelType, channelNumber)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub ChannelType, pub u16);

/// Device-reported metadata returned by `open_device`.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Vendor/product identifier string.
    pub name: String,
    /// Channels this physical device exposes.
    pub available_channels: Vec<ChannelId>,
}

/// A single channel this controller actively drives, bound to a stream name.
#[derive(Debug, Clone)]
pub struct ActiveChannel {
    /// Name of the `Stream` this channel feeds/drains.
    pub stream_name: String,
    /// The hardware channel identifier.
    pub channel: ChannelId,
}

/// The minimum set a vendor driver must implement. Raw samples are
/// driver-native `i16` counts; unit conversion happens above this trait, in
/// `Stream`/`ExternalDevice`.
pub trait HardwareBridge: Send {
    /// Open and claim the physical device.
    fn open_device(&mut self, id: &str) -> SymphonyResult<DeviceInfo>;

    /// Release the physical device. Called on every exit path from
    /// `run_epoch`, including fault recovery; failures here are logged and
    /// swallowed, never propagated.
    fn close_device(&mut self) -> SymphonyResult<()>;

    /// Declare the channels this controller will drive.
    fn configure_channels(&mut self, channels: &[ActiveChannel]) -> SymphonyResult<()>;

    /// Fill the hardware FIFO before `start_hardware` is called.
    fn preload(&mut self, out: &HashMap<ChannelId, Vec<i16>>) -> SymphonyResult<()>;

    /// Arm and start the hardware clock.
    fn start_hardware(&mut self, wait_for_trigger: bool) -> SymphonyResult<()>;

    /// Stop the hardware clock.
    fn stop_hardware(&mut self) -> SymphonyResult<()>;

    /// One synchronous duplex exchange: write `out[]` to the output FIFO,
    /// read `n_samples` per channel in `in_channels` from the input FIFO.
    /// Blocks until both halves complete or a fault is signalled.
    fn read_write(
        &mut self,
        out: &HashMap<ChannelId, Vec<i16>>,
        in_channels: &[ChannelId],
        n_samples: usize,
    ) -> SymphonyResult<HashMap<ChannelId, Vec<i16>>>;

    /// Write a single-block background value to an output channel, e.g. on
    /// clean stop.
    fn set_stream_background(&mut self, channel: ChannelId, counts: i16) -> SymphonyResult<()>;

    /// Static channel metadata (range, native units) for diagnostics.
    fn channel_info(&self, channel: ChannelId) -> SymphonyResult<String>;

    /// `true` between `start_hardware` and `stop_hardware`.
    fn is_running(&self) -> bool;

    /// `true` if the driver detected an output FIFO overflow since the last
    /// `read_write`.
    fn overflow(&self) -> bool;

    /// `true` if the driver detected an input FIFO underrun since the last
    /// `read_write`.
    fn underrun(&self) -> bool;

    /// The driver's own clock, when available (preferred over the system
    /// clock — hardware timestamps eliminate poll-interval jitter).
    fn now(&self) -> DateTime<Utc>;
}

/// `DaqController`'s lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// No device opened yet.
    Unconfigured,
    /// Device opened, channels configured, not preloaded.
    Ready,
    /// Output FIFO preloaded, not yet running.
    Preloaded,
    /// Acquisition thread active.
    Running,
    /// `stop`/`cancel` requested, acquisition thread winding down.
    Stopping,
    /// A loop fault occurred; requires `reset_hardware` to recover.
    Faulted,
}

/// Supplies one stream's worth of output data for one `process_interval`
/// tick. Built by [`crate::controller::Controller`] from a closure that
/// closes over the bound `Epoch`/`ExternalDevice`/`UnitRegistry`.
pub type OutputPuller = Box<dyn FnMut(TimeSpan) -> SymphonyResult<IOData> + Send>;

/// Delivers one stream's worth of input data for one `process_interval`
/// tick.
pub type InputPusher = Box<dyn FnMut(IOData) -> SymphonyResult<()> + Send>;

/// Minimum number of blocks that must be in flight before `start` returns —
/// fewer and the hardware FIFO underruns on the first iteration.
const MIN_PRELOAD_BLOCKS: u32 = 2;

struct LoopOutcome {
    result: SymphonyResult<()>,
}

/// The polling duplex driver: preloads the output FIFO, runs the
/// fixed-cadence acquisition loop, and owns the canonical clock.
pub struct DaqController {
    state: BridgeState,
    sample_rate: Measurement,
    process_interval: Duration,
    preload_blocks: u32,
    driver: Arc<Mutex<Box<dyn HardwareBridge>>>,
    channels: Vec<ActiveChannel>,
    cancel: Arc<AtomicBool>,
    fault: Arc<AtomicBool>,
    thread: Option<JoinHandle<LoopOutcome>>,
    counts_unit: Arc<str>,
}

impl DaqController {
    /// Construct an unconfigured controller around a vendor driver.
    ///
    /// `counts_unit` names the driver-native integer unit raw input samples
    /// are tagged with, following the `<driver>_COUNTS` convention (e.g.
    /// `"NIDAQ_COUNTS"`), and must have a converter registered to whatever
    /// target unit an `ExternalDevice` on an input stream declares.
    pub fn new(
        driver: Box<dyn HardwareBridge>,
        sample_rate: Measurement,
        process_interval: Duration,
        preload_blocks: u32,
        counts_unit: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            state: BridgeState::Unconfigured,
            sample_rate,
            process_interval,
            preload_blocks: preload_blocks.max(MIN_PRELOAD_BLOCKS),
            driver: Arc::new(Mutex::new(driver)),
            channels: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            fault: Arc::new(AtomicBool::new(false)),
            thread: None,
            counts_unit: counts_unit.into(),
        }
    }

    /// `true` if the acquisition thread exited with an error since the last
    /// `start`. Polled by [`crate::controller::Controller`] to detect a fault
    /// without blocking on `join`.
    pub fn faulted(&self) -> bool {
        self.fault.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// `PRELOAD_DURATION = preload_blocks x process_interval`.
    pub fn preload_duration(&self) -> TimeSpan {
        TimeSpan::from_duration(self.process_interval * self.preload_blocks)
    }

    /// Canonical sample rate shared by the controller and every active
    /// stream.
    pub fn sample_rate(&self) -> &Measurement {
        &self.sample_rate
    }

    /// `Unconfigured -> Ready`: open the device, declare channels, then close
    /// the raw handle.
    pub fn begin_setup(&mut self, device_id: &str, channels: Vec<ActiveChannel>) -> SymphonyResult<DeviceInfo> {
        if self.state != BridgeState::Unconfigured {
            return Err(SymphonyError::Validation(format!(
                "begin_setup requires Unconfigured, controller is {:?}",
                self.state
            )));
        }
        let mut driver = self.driver.lock().unwrap_or_else(|e| e.into_inner());
        let info = driver.open_device(device_id)?;
        driver.configure_channels(&channels)?;
        drop(driver);
        self.channels = channels;
        self.state = BridgeState::Ready;
        Ok(info)
    }

    /// Active output channels, e.g. for preload.
    fn output_channels(&self) -> Vec<&ActiveChannel> {
        self.channels.iter().filter(|c| c.channel.0.is_output()).collect()
    }

    /// Active input channels.
    fn input_channels(&self) -> Vec<&ActiveChannel> {
        self.channels.iter().filter(|c| !c.channel.0.is_output()).collect()
    }

    /// `Ready -> Preloaded -> Running`. Pulls `preload_duration()` worth of
    /// data from every active output stream via `pullers`, fails with
    /// `PreloadEmpty` if any yields zero samples, then starts the
    /// acquisition thread, which calls `pullers`/`pushers` once per
    /// `process_interval` until `is_complete()` returns `true` or `cancel()`
    /// is called.
    pub fn start(
        &mut self,
        wait_for_trigger: bool,
        mut pullers: HashMap<String, OutputPuller>,
        mut pushers: HashMap<String, InputPusher>,
        is_complete: Arc<dyn Fn() -> bool + Send + Sync>,
        events: Arc<EventBus>,
    ) -> SymphonyResult<()> {
        if self.state != BridgeState::Ready {
            return Err(SymphonyError::Validation(format!(
                "start requires Ready, controller is {:?}",
                self.state
            )));
        }

        let preload_duration = self.preload_duration();
        let mut preloaded: HashMap<ChannelId, Vec<i16>> = HashMap::new();
        for out in self.output_channels() {
            let puller = pullers
                .get_mut(&out.stream_name)
                .ok_or_else(|| SymphonyError::Validation(format!("no puller bound for stream '{}'", out.stream_name)))?;
            let block = puller(preload_duration)?;
            if block.is_empty() {
                return Err(SymphonyError::PreloadEmpty {
                    stream: out.stream_name.clone(),
                });
            }
            preloaded.insert(out.channel, block.to_counts());
        }

        {
            let mut driver = self.driver.lock().unwrap_or_else(|e| e.into_inner());
            driver.preload(&preloaded)?;
        }
        self.state = BridgeState::Preloaded;

        {
            let mut driver = self.driver.lock().unwrap_or_else(|e| e.into_inner());
            driver.start_hardware(wait_for_trigger)?;
        }
        self.state = BridgeState::Running;
        self.cancel.store(false, Ordering::SeqCst);
        self.fault.store(false, Ordering::SeqCst);
        events.fire(Event::Started);

        let driver = self.driver.clone();
        let cancel = self.cancel.clone();
        let fault = self.fault.clone();
        let process_interval = self.process_interval;
        let sample_rate = self.sample_rate.clone();
        let out_channels: Vec<ChannelId> = self.output_channels().into_iter().map(|c| c.channel).collect();
        let in_channels: Vec<(String, ChannelId)> = self
            .input_channels()
            .into_iter()
            .map(|c| (c.stream_name.clone(), c.channel))
            .collect();
        let stream_for_out: HashMap<ChannelId, String> = self
            .output_channels()
            .into_iter()
            .map(|c| (c.channel, c.stream_name.clone()))
            .collect();
        let counts_unit = self.counts_unit.clone();

        self.thread = Some(std::thread::spawn(move || {
            let outcome = run_acquisition_loop(
                &driver,
                &cancel,
                process_interval,
                &sample_rate,
                &out_channels,
                &stream_for_out,
                &in_channels,
                &mut pullers,
                &mut pushers,
                is_complete.as_ref(),
                events.as_ref(),
                &counts_unit,
            );
            if outcome.is_err() {
                fault.store(true, Ordering::SeqCst);
            }
            LoopOutcome { result: outcome }
        }));

        Ok(())
    }

    /// `Running -> Stopping -> Ready`: cooperative cancellation, joins the
    /// acquisition thread, then parks each output stream at its device
    /// background.
    pub fn stop(&mut self, output_backgrounds: &HashMap<String, Measurement>, registry: &UnitRegistry) -> SymphonyResult<()> {
        if let Err(err) = self.request_stop_and_join() {
            self.state = BridgeState::Faulted;
            return Err(err);
        }
        self.park_outputs_at_background(output_backgrounds, registry)?;
        self.state = BridgeState::Ready;
        Ok(())
    }

    /// Same as `stop` but the caller is discarding the in-flight Epoch; the
    /// distinction lives in the Controller (which skips persistence), not
    /// here.
    pub fn cancel(&mut self, output_backgrounds: &HashMap<String, Measurement>, registry: &UnitRegistry) -> SymphonyResult<()> {
        self.stop(output_backgrounds, registry)
    }

    fn request_stop_and_join(&mut self) -> SymphonyResult<()> {
        self.cancel.store(true, Ordering::SeqCst);
        self.state = BridgeState::Stopping;
        if let Some(handle) = self.thread.take() {
            let outcome = handle.join().map_err(|_| SymphonyError::Validation("acquisition thread panicked".into()))?;
            outcome.result?;
        }
        let mut driver = self.driver.lock().unwrap_or_else(|e| e.into_inner());
        driver.stop_hardware()
    }

    fn park_outputs_at_background(&mut self, output_backgrounds: &HashMap<String, Measurement>, registry: &UnitRegistry) -> SymphonyResult<()> {
        let mut driver = self.driver.lock().unwrap_or_else(|e| e.into_inner());
        for out in self.channels.iter().filter(|c| c.channel.0.is_output()) {
            if let Some(bg) = output_backgrounds.get(&out.stream_name) {
                driver.set_stream_background(out.channel, bg_to_counts(bg, registry))?;
            }
        }
        Ok(())
    }

    /// `Running -> Faulted` is driven from inside the acquisition loop; this
    /// transitions `Faulted -> Ready` by re-opening the device and restoring
    /// backgrounds.
    pub fn reset_hardware(&mut self, device_id: &str, output_backgrounds: &HashMap<String, Measurement>, registry: &UnitRegistry) -> SymphonyResult<()> {
        if self.state != BridgeState::Faulted {
            return Err(SymphonyError::Validation(format!(
                "reset_hardware requires Faulted, controller is {:?}",
                self.state
            )));
        }
        {
            let mut driver = self.driver.lock().unwrap_or_else(|e| e.into_inner());
            driver.open_device(device_id)?;
            driver.configure_channels(&self.channels)?;
        }
        self.park_outputs_at_background(output_backgrounds, registry)?;
        self.state = BridgeState::Ready;
        Ok(())
    }

    /// Explicit final teardown, independent of the Unconfigured/Ready/...
    /// lifecycle. Failures are logged, never propagated.
    pub fn close(&mut self) {
        let mut driver = self.driver.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = driver.close_device() {
            tracing::warn!(error = %err, "device close failed during teardown");
        }
    }

    /// Whether the acquisition thread is currently running.
    pub fn is_running(&self) -> bool {
        matches!(self.state, BridgeState::Running)
    }

    /// The driver's canonical clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.driver.lock().unwrap_or_else(|e| e.into_inner()).now()
    }

    /// Read `n_samples` from a single input channel without starting the
    /// acquisition loop — used to probe a signal (e.g. the resting value of a
    /// wire) while the bridge is idle. Mutually exclusive with the
    /// acquisition thread via the state machine: only callable in `Ready`.
    pub async fn read_stream_async_io(&self, channel: ChannelId, n_samples: usize) -> SymphonyResult<Vec<i16>> {
        if self.state != BridgeState::Ready {
            return Err(SymphonyError::Validation(format!(
                "read_stream_async_io requires Ready, controller is {:?}",
                self.state
            )));
        }
        let driver = self.driver.clone();
        tokio::task::spawn_blocking(move || {
            let mut driver = driver.lock().unwrap_or_else(|e| e.into_inner());
            let out: HashMap<ChannelId, Vec<i16>> = HashMap::new();
            let result = driver.read_write(&out, &[channel], n_samples)?;
            Ok(result.get(&channel).cloned().unwrap_or_default())
        })
        .await
        .map_err(|_| SymphonyError::Validation("async IO probe task panicked".into()))?
    }
}

fn bg_to_counts(bg: &Measurement, _registry: &UnitRegistry) -> i16 {
    bg.value().round().to_i16().unwrap_or(0)
}

#[allow(clippy::too_many_arguments)]
fn run_acquisition_loop(
    driver: &Arc<Mutex<Box<dyn HardwareBridge>>>,
    cancel: &AtomicBool,
    process_interval: Duration,
    sample_rate: &Measurement,
    out_channels: &[ChannelId],
    stream_for_out: &HashMap<ChannelId, String>,
    in_channels: &[(String, ChannelId)],
    pullers: &mut HashMap<String, OutputPuller>,
    pushers: &mut HashMap<String, InputPusher>,
    is_complete: &(dyn Fn() -> bool + Send + Sync),
    events: &EventBus,
    counts_unit: &str,
) -> SymphonyResult<()> {
    let tick = TimeSpan::from_duration(process_interval);
    let mut deficit: HashMap<ChannelId, Vec<i16>> = HashMap::new();
    let in_channel_ids: Vec<ChannelId> = in_channels.iter().map(|(_, c)| *c).collect();

    loop {
        if cancel.load(Ordering::SeqCst) || is_complete() {
            break;
        }

        let mut out: HashMap<ChannelId, Vec<i16>> = HashMap::new();
        let mut n_samples = 0usize;
        for channel in out_channels {
            let stream_name = stream_for_out.get(channel).expect("channel declared as output");
            let puller = pullers.get_mut(stream_name).expect("puller bound for active output stream");
            let mut counts = puller(tick)?.to_counts();
            n_samples = n_samples.max(counts.len());
            if let Some(carried) = deficit.remove(channel) {
                let mut combined = carried;
                combined.append(&mut counts);
                out.insert(*channel, combined);
            } else {
                out.insert(*channel, counts);
            }
        }
        if n_samples == 0 {
            n_samples = tick.to_samples(1.0).max(1);
        }

        let returned = {
            let mut driver_guard = driver.lock().unwrap_or_else(|e| e.into_inner());
            let result = driver_guard.read_write(&out, &in_channel_ids, n_samples);
            let overflow = driver_guard.overflow();
            let underrun = driver_guard.underrun();
            drop(driver_guard);
            if underrun {
                return Err(SymphonyError::HardwareBufferUnderrun {
                    channel: in_channels.first().map(|(n, _)| n.clone()).unwrap_or_default(),
                });
            }
            if overflow {
                return Err(SymphonyError::HardwareBufferOverrun {
                    channel: out_channels
                        .first()
                        .and_then(|c| stream_for_out.get(c).cloned())
                        .unwrap_or_default(),
                });
            }
            result?
        };

        // Account for any leftover head the driver didn't consume this
        // iteration: whatever wasn't written becomes next iteration's
        // deficit, re-sent before new data.
        for channel in out_channels {
            let sent_len = out.get(channel).map(Vec::len).unwrap_or(0);
            if sent_len > n_samples {
                let leftover = out[channel][n_samples..].to_vec();
                deficit.insert(*channel, leftover);
            }
        }

        for (stream_name, channel) in in_channels {
            if let Some(counts) = returned.get(channel) {
                let samples: Vec<Measurement> = counts.iter().map(|c| Measurement::of(f64::from(*c), counts_unit)).collect();
                let block = IOData::new(samples, sample_rate.clone())?;
                let pusher = pushers.get_mut(stream_name).expect("pusher bound for active input stream");
                pusher(block)?;
            }
        }

        events.fire(Event::ProcessIteration);
    }

    Ok(())
}

/// A deterministic in-memory driver used by tests and as the default when no
/// vendor driver is wired in. Supports configurable loopback (tying an
/// output channel's written samples back to an input channel after a fixed
/// sample-depth delay) and injected overflow/underrun faults.
pub struct MockDriver {
    opened: bool,
    running: bool,
    loopback: HashMap<ChannelId, ChannelId>,
    loopback_depth: usize,
    loopback_history: HashMap<ChannelId, std::collections::VecDeque<i16>>,
    backgrounds: HashMap<ChannelId, i16>,
    inject_underrun_after: Option<u32>,
    inject_overflow_after: Option<u32>,
    iterations: u32,
    underrun_flag: bool,
    overflow_flag: bool,
    clock_epoch: std::time::Instant,
}

impl MockDriver {
    /// A driver with no faults or loopback configured.
    pub fn new() -> Self {
        Self {
            opened: false,
            running: false,
            loopback: HashMap::new(),
            loopback_depth: 0,
            loopback_history: HashMap::new(),
            backgrounds: HashMap::new(),
            inject_underrun_after: None,
            inject_overflow_after: None,
            iterations: 0,
            underrun_flag: false,
            overflow_flag: false,
            clock_epoch: std::time::Instant::now(),
        }
    }

    /// Tie `out`'s written samples back to `in_ch`'s returned samples,
    /// delayed by `depth` samples (vendor-specified pipeline depth).
    pub fn with_loopback(mut self, out: ChannelId, in_ch: ChannelId, depth: usize) -> Self {
        self.loopback.insert(out, in_ch);
        self.loopback_depth = depth;
        self
    }

    /// Fail `read_write` with an underrun flag after `n` successful
    /// iterations.
    pub fn with_injected_underrun_after(mut self, n: u32) -> Self {
        self.inject_underrun_after = Some(n);
        self
    }

    /// Fail `read_write` with an overflow flag after `n` successful
    /// iterations.
    pub fn with_injected_overflow_after(mut self, n: u32) -> Self {
        self.inject_overflow_after = Some(n);
        self
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareBridge for MockDriver {
    fn open_device(&mut self, _id: &str) -> SymphonyResult<DeviceInfo> {
        self.opened = true;
        Ok(DeviceInfo {
            name: "mock".into(),
            available_channels: Vec::new(),
        })
    }

    fn close_device(&mut self) -> SymphonyResult<()> {
        self.opened = false;
        Ok(())
    }

    fn configure_channels(&mut self, _channels: &[ActiveChannel]) -> SymphonyResult<()> {
        Ok(())
    }

    fn preload(&mut self, _out: &HashMap<ChannelId, Vec<i16>>) -> SymphonyResult<()> {
        Ok(())
    }

    fn start_hardware(&mut self, _wait_for_trigger: bool) -> SymphonyResult<()> {
        self.running = true;
        self.iterations = 0;
        Ok(())
    }

    fn stop_hardware(&mut self) -> SymphonyResult<()> {
        self.running = false;
        Ok(())
    }

    fn read_write(
        &mut self,
        out: &HashMap<ChannelId, Vec<i16>>,
        in_channels: &[ChannelId],
        n_samples: usize,
    ) -> SymphonyResult<HashMap<ChannelId, Vec<i16>>> {
        self.iterations += 1;
        self.underrun_flag = self.inject_underrun_after == Some(self.iterations);
        self.overflow_flag = self.inject_overflow_after == Some(self.iterations);

        for (out_ch, in_ch) in &self.loopback {
            let history = self.loopback_history.entry(*in_ch).or_default();
            if let Some(samples) = out.get(out_ch) {
                history.extend(samples.iter().copied());
            }
        }

        let mut result = HashMap::new();
        for channel in in_channels {
            let mut samples = Vec::with_capacity(n_samples);
            if self.loopback.values().any(|c| c == channel) {
                let history = self.loopback_history.entry(*channel).or_default();
                for _ in 0..n_samples {
                    if history.len() > self.loopback_depth {
                        samples.push(history.pop_front().unwrap_or(0));
                    } else {
                        samples.push(0);
                    }
                }
            } else {
                let bg = self.backgrounds.get(channel).copied().unwrap_or(0);
                samples.resize(n_samples, bg);
            }
            result.insert(*channel, samples);
        }
        Ok(result)
    }

    fn set_stream_background(&mut self, channel: ChannelId, counts: i16) -> SymphonyResult<()> {
        self.backgrounds.insert(channel, counts);
        // A background parked on an output physically tied to an input shows
        // up on that wire immediately, not N samples later -- there's no new
        // edge for the pipeline depth to delay.
        if let Some(&in_ch) = self.loopback.get(&channel) {
            let history = self.loopback_history.entry(in_ch).or_default();
            history.clear();
            history.extend(std::iter::repeat(counts).take(self.loopback_depth + 1));
        }
        Ok(())
    }

    fn channel_info(&self, channel: ChannelId) -> SymphonyResult<String> {
        Ok(format!("{:?}{}", channel.0, channel.1))
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn overflow(&self) -> bool {
        self.overflow_flag
    }

    fn underrun(&self) -> bool {
        self.underrun_flag
    }

    fn now(&self) -> DateTime<Utc> {
        let _ = &self.clock_epoch;
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::iodata::IOData;
    use std::sync::atomic::AtomicUsize;

    fn stimulus_puller(total: usize) -> OutputPuller {
        let pulled = Arc::new(AtomicUsize::new(0));
        Box::new(move |duration: TimeSpan| {
            let rate = 1000.0;
            let already = pulled.load(Ordering::SeqCst);
            let remaining = total.saturating_sub(already);
            let want = duration.to_samples(rate).min(remaining);
            pulled.fetch_add(want, Ordering::SeqCst);
            let samples = (0..want).map(|_| Measurement::of(1.0, "V")).collect();
            IOData::new(samples, Measurement::of(rate, "Hz"))
        })
    }

    #[test]
    fn preload_empty_fails_fast_with_no_hardware_start() {
        let driver = Box::new(MockDriver::new());
        let mut controller = DaqController::new(driver, Measurement::of(1000.0, "Hz"), Duration::from_millis(250), 2, "MOCK_COUNTS");
        let channel = ActiveChannel {
            stream_name: "ao0".into(),
            channel: ChannelId(ChannelType::AnalogOut, 0),
        };
        controller.begin_setup("mock0", vec![channel]).unwrap();

        let mut pullers: HashMap<String, OutputPuller> = HashMap::new();
        pullers.insert("ao0".into(), stimulus_puller(0));
        let events = Arc::new(EventBus::new());
        let result = controller.start(false, pullers, HashMap::new(), Arc::new(|| false), events);
        assert!(matches!(result, Err(SymphonyError::PreloadEmpty { .. })));
        assert_eq!(controller.state(), BridgeState::Ready);
    }

    #[test]
    fn preload_delivers_exact_sample_count_before_start_returns() {
        let driver = Box::new(MockDriver::new());
        let mut controller = DaqController::new(driver, Measurement::of(1000.0, "Hz"), Duration::from_millis(250), 2, "MOCK_COUNTS");
        let channel = ActiveChannel {
            stream_name: "ao0".into(),
            channel: ChannelId(ChannelType::AnalogOut, 0),
        };
        controller.begin_setup("mock0", vec![channel]).unwrap();

        let mut pullers: HashMap<String, OutputPuller> = HashMap::new();
        pullers.insert("ao0".into(), stimulus_puller(10_000));
        let events = Arc::new(EventBus::new());
        let is_complete = Arc::new(AtomicBool::new(false));
        let is_complete_check = is_complete.clone();
        controller
            .start(false, pullers, HashMap::new(), Arc::new(move || is_complete_check.load(Ordering::SeqCst)), events)
            .unwrap();
        assert_eq!(controller.state(), BridgeState::Running);
        is_complete.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        let backgrounds = HashMap::new();
        let registry = UnitRegistry::new();
        controller.stop(&backgrounds, &registry).unwrap();
        assert_eq!(controller.state(), BridgeState::Ready);
    }

    #[tokio::test]
    async fn async_io_probe_reads_the_parked_background_while_ready() {
        let driver = Box::new(MockDriver::new());
        let mut controller = DaqController::new(driver, Measurement::of(1000.0, "Hz"), Duration::from_millis(10), 2, "MOCK_COUNTS");
        let out = ActiveChannel {
            stream_name: "ao0".into(),
            channel: ChannelId(ChannelType::AnalogOut, 0),
        };
        let ain = ChannelId(ChannelType::AnalogIn, 0);
        controller.begin_setup("mock0", vec![out]).unwrap();

        {
            let mut drv = controller.driver.lock().unwrap_or_else(|e| e.into_inner());
            drv.set_stream_background(ain, -42).unwrap();
        }

        let samples = controller.read_stream_async_io(ain, 5).await.unwrap();
        assert_eq!(samples, vec![-42; 5]);
    }

    #[tokio::test]
    async fn async_io_probe_is_rejected_while_running() {
        let driver = Box::new(MockDriver::new());
        let mut controller = DaqController::new(driver, Measurement::of(1000.0, "Hz"), Duration::from_millis(10), 2, "MOCK_COUNTS");
        let out = ActiveChannel {
            stream_name: "ao0".into(),
            channel: ChannelId(ChannelType::AnalogOut, 0),
        };
        controller.begin_setup("mock0", vec![out]).unwrap();

        let mut pullers: HashMap<String, OutputPuller> = HashMap::new();
        pullers.insert("ao0".into(), stimulus_puller(10_000));
        let events = Arc::new(EventBus::new());
        controller.start(false, pullers, HashMap::new(), Arc::new(|| false), events).unwrap();

        let err = controller.read_stream_async_io(ChannelId(ChannelType::AnalogIn, 0), 1).await.unwrap_err();
        assert!(matches!(err, SymphonyError::Validation(_)));

        let backgrounds = HashMap::new();
        let registry = UnitRegistry::new();
        controller.stop(&backgrounds, &registry).unwrap();
    }
}
