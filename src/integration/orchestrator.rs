//! Interaction orchestrator
//!
//! Runs the voice pipeline (wake -> capture -> recognize -> converse ->
//! speak) on one thread and owns the engine state. Every blocking
//! collaborator call runs on a helper thread; the orchestrator waits on its
//! result together with the command channel, so an interrupt aborts any
//! suspended stage at once and the abandoned result is dropped.
//!
//! Front ends only see an [`EngineHandle`]: a command sender plus the event
//! bus.

use super::config::{EngineConfig, EngineSettings, ShutdownPhrases};
use crate::audio::{
    AudioFrame, AudioFrameSource, CaptureOutcome, CaptureProgress, FrameBuffer, FrameReader, SpeechCapturer,
    SpeechDetector, Utterance,
};
use crate::events::{EngineSnapshot, EngineState, ErrorKind, EventBus, OutboundEvent, Subscription, WakeTrigger};
use crate::llm::{AiBackend, ConversationEngine, ConversationError, OllamaBackend, Turn, TurnTicket};
use crate::monitor::{recommendations, MetricsProbe, MonitorReadings, PerformanceMonitor, ResourceStats, SystemProbe};
use crate::speech::{
    clean_for_speech, CommandVoice, PlaybackHandle, PlaybackReport, RecognitionConfig, RecognitionError,
    RecognitionProvider, Recognizer, SentenceSplitter, SinkSynthesizer, SynthesisConfig, SynthesisError, Synthesizer,
};
use crate::utils::{PipelineStats, PipelineTimings, Stopwatch, TIMING_WINDOW};
use crate::wake::{scorer_for, KeywordScorer, WakeConfig, WakeError, WakeWordDetector};
use crate::{ParleyError, Result};
use crossbeam_channel::{bounded, never, select, unbounded, Receiver, RecvError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Extra time granted past a collaborator's own timeout before giving up on it
const GUARD_SLACK: Duration = Duration::from_secs(1);

/// Longest a single sentence may take to render and play
const SENTENCE_GUARD: Duration = Duration::from_secs(30);

/// Longest a spoken cue may take
const CUE_GUARD: Duration = Duration::from_secs(10);

/// Commands accepted from front ends
#[derive(Debug, Clone)]
pub enum EngineCommand {
    /// Start a capture cycle without the wake word
    Activate,

    /// Abort whatever is in flight and return to Idle
    Interrupt,

    /// Stop listening for the wake word
    Mute,

    /// Resume listening for the wake word
    Unmute,

    /// Replace the runtime settings; applied once the engine is Idle
    UpdateSettings(Box<EngineSettings>),

    /// Forget the conversation so far; applied once the engine is Idle
    ClearHistory,

    /// Stop the engine and close every subscription
    Shutdown,
}

/// Builds the wake-word scorer for a wake configuration
pub type ScorerFactory = Box<dyn Fn(&WakeConfig) -> std::result::Result<Box<dyn KeywordScorer>, WakeError> + Send>;

/// State shared between the orchestrator thread and its handles
struct Shared {
    state: RwLock<EngineState>,
    muted: AtomicBool,
    interrupt: AtomicBool,
    running: AtomicBool,
}

/// Latency and load summary
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub pipeline: PipelineStats,
    pub resources: ResourceStats,
    pub recommendations: Vec<String>,
}

/// Cloneable front-end handle to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    commands: Sender<EngineCommand>,
    bus: EventBus,
    shared: Arc<Shared>,
    conversation: Arc<ConversationEngine>,
    timings: Arc<Mutex<PipelineTimings>>,
    readings: Option<MonitorReadings>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EngineHandle {
    /// Send a command to the orchestrator
    pub fn send_command(&self, command: EngineCommand) -> Result<()> {
        if let EngineCommand::Interrupt = command {
            self.shared.interrupt.store(true, Ordering::SeqCst);
        }
        self.commands
            .send(command)
            .map_err(|e| ParleyError::Channel(format!("engine is not running: {}", e)))
    }

    /// Abort any in-flight stage. A no-op when Idle.
    pub fn interrupt(&self) -> Result<()> {
        self.send_command(EngineCommand::Interrupt)
    }

    pub fn activate(&self) -> Result<()> {
        self.send_command(EngineCommand::Activate)
    }

    pub fn mute(&self) -> Result<()> {
        self.send_command(EngineCommand::Mute)
    }

    pub fn unmute(&self) -> Result<()> {
        self.send_command(EngineCommand::Unmute)
    }

    pub fn update_settings(&self, settings: EngineSettings) -> Result<()> {
        self.send_command(EngineCommand::UpdateSettings(Box::new(settings)))
    }

    pub fn clear_history(&self) -> Result<()> {
        self.send_command(EngineCommand::ClearHistory)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send_command(EngineCommand::Shutdown)
    }

    /// Current status plus a live feed of every event published after it
    pub fn subscribe(&self) -> (EngineSnapshot, Subscription) {
        let subscription = self.bus.subscribe();
        (self.snapshot(), subscription)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state: self.state(),
            muted: self.is_muted(),
            latest_sample: self.readings.as_ref().and_then(MonitorReadings::latest),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.read()
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Remembered turns, oldest first
    pub fn history(&self) -> Vec<Turn> {
        self.conversation.history()
    }

    pub fn stats(&self) -> EngineStats {
        let pipeline = self.timings.lock().stats();
        let resources = self.readings.as_ref().map(MonitorReadings::stats).unwrap_or_default();
        EngineStats {
            recommendations: recommendations(&pipeline, &resources),
            pipeline,
            resources,
        }
    }

    /// Wait for the orchestrator thread to finish
    pub fn join(&self) -> Result<()> {
        let worker = self.worker.lock().take();
        match worker {
            Some(worker) => worker
                .join()
                .map_err(|_| ParleyError::Orchestrator("orchestrator thread panicked".into())),
            None => Ok(()),
        }
    }
}

/// Why a suspended stage stopped early
enum Abort {
    Interrupt,
    /// The wake word was heard while speaking
    BargeIn(WakeTrigger),
    Shutdown,
}

/// Outcome of waiting on a helper thread
enum Waited<T> {
    Done(T),
    TimedOut,
    /// The helper exited without answering
    Lost,
}

enum Flow {
    Continue,
    Stop,
}

/// Latencies of the current cycle so far
#[derive(Default)]
struct CycleTimes {
    recognition: Duration,
    backend: Duration,
}

/// The state machine. Built by [`OrchestratorBuilder`] and moved onto its
/// own thread by `start`.
pub struct Orchestrator {
    config: EngineConfig,
    source: Box<dyn AudioFrameSource>,
    frames: FrameReader,
    /// Frames that followed a wake detection in the same batch
    carry: Vec<AudioFrame>,
    source_done: bool,
    wake: WakeWordDetector,
    scorer_factory: ScorerFactory,
    capturer: SpeechCapturer,
    custom_detector: bool,
    recognizer: Arc<dyn Recognizer>,
    conversation: Arc<ConversationEngine>,
    synthesizer: Arc<dyn Synthesizer>,
    commands: Receiver<EngineCommand>,
    bus: EventBus,
    shared: Arc<Shared>,
    timings: Arc<Mutex<PipelineTimings>>,
    monitor: Option<PerformanceMonitor>,
    shutdown_phrases: ShutdownPhrases,
    deferred: Vec<EngineCommand>,
    speech_active: bool,
    /// A shutdown was asked for, by phrase or command
    farewell_due: bool,
}

impl Orchestrator {
    pub fn builder(config: EngineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    fn run(mut self) {
        info!(
            "Engine listening for '{}' ({} Hz, {} samples/frame)",
            self.config.wake.wake_word, self.config.audio.sample_rate, self.config.audio.frame_len
        );
        let commands = self.commands.clone();

        loop {
            if self.source_done {
                match self.frames.failure() {
                    Some(reason) => {
                        error!("Audio source failed: {}", reason);
                        self.bus.publish(OutboundEvent::error(ErrorKind::Audio, reason));
                    }
                    None => info!("Audio source ended"),
                }
                break;
            }
            let ready = self.ready_channel();
            let flow = select! {
                recv(commands) -> command => match command {
                    Ok(command) => self.handle_idle_command(command),
                    Err(_) => {
                        debug!("Every engine handle dropped");
                        Flow::Stop
                    }
                },
                recv(ready) -> _ => self.listen_for_wake(),
            };
            if let Flow::Stop = flow {
                break;
            }
        }

        self.stop();
    }

    fn handle_idle_command(&mut self, command: EngineCommand) -> Flow {
        match command {
            EngineCommand::Activate => {
                info!("Manual activation");
                return self.run_cycle(WakeTrigger::Manual);
            }
            EngineCommand::Interrupt => {
                self.shared.interrupt.store(false, Ordering::SeqCst);
                debug!("Interrupt while idle ignored");
            }
            EngineCommand::Mute => self.set_muted(true),
            EngineCommand::Unmute => self.set_muted(false),
            EngineCommand::UpdateSettings(settings) => self.apply_settings(*settings),
            EngineCommand::ClearHistory => self.conversation.clear(),
            EngineCommand::Shutdown => {
                info!("Shutdown requested");
                self.farewell_due = true;
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Feed buffered frames to the wake detector
    fn listen_for_wake(&mut self) -> Flow {
        let frames = self.frames.drain();
        if self.frames.is_finished() {
            self.source_done = true;
        }
        if self.is_muted() {
            return Flow::Continue;
        }
        if let Some(trigger) = self.detect_wake(frames) {
            info!("Wake word '{}' detected", self.config.wake.wake_word);
            return self.run_cycle(trigger);
        }
        Flow::Continue
    }

    /// One or more capture cycles (barge-in chains them), ending in Idle
    fn run_cycle(&mut self, trigger: WakeTrigger) -> Flow {
        let mut trigger = trigger;
        // An interrupt sent while idle must not cancel the new cycle
        self.shared.interrupt.store(false, Ordering::SeqCst);

        let flow = loop {
            self.bus.publish(OutboundEvent::WakeDetected { trigger });
            self.transition(EngineState::Listening);

            match self.cycle() {
                Ok(()) => break Flow::Continue,
                Err(Abort::Interrupt) => {
                    self.unwind_interrupt(false);
                    break Flow::Continue;
                }
                Err(Abort::BargeIn(next)) => {
                    info!("Barge-in: wake word heard while speaking");
                    self.unwind_interrupt(true);
                    trigger = next;
                }
                Err(Abort::Shutdown) => {
                    self.unwind_interrupt(false);
                    break Flow::Stop;
                }
            }
        };

        self.settle();
        flow
    }

    fn cycle(&mut self) -> std::result::Result<(), Abort> {
        if let Some(acknowledgement) = self.config.cues.acknowledgement.clone() {
            self.play_cue(&acknowledgement)?;
            // Whatever the microphone heard meanwhile is the cue itself
            self.carry.clear();
            self.frames.discard();
        }

        let Some(utterance) = self.capture()? else {
            return Ok(());
        };

        let mut times = CycleTimes::default();
        let mut stopwatch = Stopwatch::start();
        let Some(text) = self.recognize(utterance)? else {
            return Ok(());
        };
        times.recognition = stopwatch.split("recognition");
        self.timings.lock().recognition.record(times.recognition);
        self.checkpoint()?;

        if self.shutdown_phrases.matches(&text) {
            info!("Shutdown phrase '{}' heard", text);
            self.farewell_due = true;
            self.go_idle();
            return Err(Abort::Shutdown);
        }

        self.transition(EngineState::Thinking);
        let Some(turn) = self.converse(&text)? else {
            return Ok(());
        };
        times.backend = Duration::from_millis(turn.latency_ms);
        self.checkpoint()?;

        self.speak(&turn, &times)
    }

    /// Listening/Capturing: collect the utterance
    fn capture(&mut self) -> std::result::Result<Option<Utterance>, Abort> {
        self.capturer.activate();
        let guard = self.config.capture.max_utterance() + GUARD_SLACK;
        let deadline = Instant::now() + guard;
        let commands = self.commands.clone();

        loop {
            if let Err(abort) = self.checkpoint() {
                self.capturer.cancel();
                return Err(abort);
            }

            let mut frames = std::mem::take(&mut self.carry);
            frames.extend(self.frames.drain());
            for frame in frames {
                match self.capturer.push(frame) {
                    CaptureProgress::Capturing { speech_started: true } => {
                        if *self.shared.state.read() == EngineState::Listening {
                            self.transition(EngineState::Capturing);
                        }
                    }
                    CaptureProgress::Complete(outcome) => return Ok(self.captured(outcome)),
                    _ => {}
                }
            }

            if self.frames.is_finished() {
                self.source_done = true;
                debug!("Audio ended mid-capture");
                let outcome = self.capturer.finish();
                return Ok(self.captured(outcome));
            }

            let ready = self.ready_channel();
            select! {
                recv(commands) -> command => {
                    if let Err(abort) = self.on_busy_command(command) {
                        self.capturer.cancel();
                        return Err(abort);
                    }
                }
                recv(ready) -> _ => {}
                default(deadline.saturating_duration_since(Instant::now())) => {
                    warn!("No audio within {:?}; ending capture", guard);
                    let outcome = self.capturer.finish();
                    return Ok(self.captured(outcome));
                }
            }
        }
    }

    fn captured(&mut self, outcome: CaptureOutcome) -> Option<Utterance> {
        match outcome {
            CaptureOutcome::Utterance(utterance) => {
                if *self.shared.state.read() == EngineState::Listening {
                    self.transition(EngineState::Capturing);
                }
                self.bus.publish(OutboundEvent::UtteranceCaptured {
                    duration_ms: utterance.duration().as_millis() as u64,
                    speech_ms: utterance.speech_duration().as_millis() as u64,
                });
                self.transition(EngineState::Recognizing);
                Some(utterance)
            }
            CaptureOutcome::Discarded(reason) => {
                info!("Capture discarded: {}", reason);
                // Every capture ends from Capturing, even one that only heard silence
                if *self.shared.state.read() == EngineState::Listening {
                    self.transition(EngineState::Capturing);
                }
                self.bus.publish(OutboundEvent::UtteranceDiscarded { reason });
                self.go_idle();
                None
            }
        }
    }

    /// Recognizing: utterance ownership moves to the recognizer thread
    fn recognize(&mut self, utterance: Utterance) -> std::result::Result<Option<String>, Abort> {
        let (tx, rx) = bounded(1);
        let recognizer = Arc::clone(&self.recognizer);
        let spawned = thread::Builder::new().name("recognize".into()).spawn(move || {
            let _ = tx.send(recognizer.recognize(utterance));
        });
        if let Err(e) = spawned {
            return Ok(self.fail(ErrorKind::Recognition, format!("failed to start recognition: {}", e)));
        }

        let timeout = self.config.recognition.timeout();
        let result = match self.wait_for(&rx, timeout)? {
            Waited::Done(result) => result,
            Waited::TimedOut => Err(RecognitionError::Timeout),
            Waited::Lost => Err(RecognitionError::Provider("recognizer exited".into())),
        };

        match result {
            Ok(text) if !text.trim().is_empty() => {
                let text = text.trim().to_string();
                info!("Heard: \"{}\"", text);
                self.bus.publish(OutboundEvent::RecognitionResult { text: text.clone() });
                Ok(Some(text))
            }
            Ok(_) => Ok(self.fail(ErrorKind::Recognition, RecognitionError::Unintelligible.to_string())),
            Err(e) => Ok(self.fail(ErrorKind::Recognition, e.to_string())),
        }
    }

    /// Thinking: one cancellable conversation turn
    fn converse(&mut self, text: &str) -> std::result::Result<Option<Turn>, Abort> {
        let ticket = TurnTicket::new();
        let (tx, rx) = bounded(1);
        let conversation = Arc::clone(&self.conversation);
        let worker_ticket = ticket.clone();
        let user_text = text.to_string();
        let spawned = thread::Builder::new().name("conversation".into()).spawn(move || {
            let _ = tx.send(conversation.respond_with(&user_text, &worker_ticket));
        });
        if let Err(e) = spawned {
            return Ok(self.fail(ErrorKind::Backend, format!("failed to start query: {}", e)));
        }

        let timeout = self.config.llm.timeout() + GUARD_SLACK;
        let waited = match self.wait_for(&rx, timeout) {
            Ok(waited) => waited,
            Err(abort) => {
                ticket.cancel();
                return Err(abort);
            }
        };

        match waited {
            Waited::Done(Ok(turn)) => {
                self.timings
                    .lock()
                    .backend
                    .record(Duration::from_millis(turn.latency_ms));
                info!("Reply in {} ms", turn.latency_ms);
                self.bus.publish(OutboundEvent::ConversationTurn { turn: turn.clone() });
                self.transition(EngineState::Speaking);
                Ok(Some(turn))
            }
            Waited::Done(Err(ConversationError::Busy)) => {
                warn!("Conversation engine busy; dropping utterance");
                self.go_idle();
                Ok(None)
            }
            Waited::Done(Err(ConversationError::Cancelled)) => Err(Abort::Interrupt),
            Waited::Done(Err(e)) => self.backend_failed(e.to_string()),
            Waited::TimedOut => {
                ticket.cancel();
                self.backend_failed(format!("no reply within {:?}", timeout))
            }
            Waited::Lost => self.backend_failed("conversation worker exited".to_string()),
        }
    }

    /// Report the failure, say the fallback line, then return to Idle
    fn backend_failed(&mut self, message: String) -> std::result::Result<Option<Turn>, Abort> {
        warn!("{} failed: {}", ErrorKind::Backend, message);
        self.bus.publish(OutboundEvent::error(ErrorKind::Backend, message));
        if let Some(fallback) = self.config.cues.fallback.clone() {
            self.play_cue(&fallback)?;
        }
        self.go_idle();
        Ok(None)
    }

    /// Speak a short cue and wait for it, serving commands meanwhile. A cue
    /// that cannot be spoken is only logged.
    fn play_cue(&mut self, text: &str) -> std::result::Result<(), Abort> {
        let handle = match self.synthesizer.synthesize(text) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Cue '{}' not spoken: {}", text, e);
                return Ok(());
            }
        };
        let deadline = Instant::now() + CUE_GUARD;
        let commands = self.commands.clone();

        loop {
            if let Err(abort) = self.checkpoint() {
                handle.stop();
                return Err(abort);
            }
            select! {
                recv(handle.done()) -> result => {
                    if let Ok(Err(e)) = result {
                        warn!("Cue '{}' failed: {}", text, e);
                    }
                    return Ok(());
                }
                recv(commands) -> command => {
                    if let Err(abort) = self.on_busy_command(command) {
                        handle.stop();
                        return Err(abort);
                    }
                }
                default(deadline.saturating_duration_since(Instant::now())) => {
                    warn!("Cue '{}' took longer than {:?}", text, CUE_GUARD);
                    handle.stop();
                    return Ok(());
                }
            }
        }
    }

    /// Speaking: play the reply sentence by sentence
    fn speak(&mut self, turn: &Turn, times: &CycleTimes) -> std::result::Result<(), Abort> {
        let spoken = clean_for_speech(&turn.assistant_text);
        let sentences = SentenceSplitter::split(&spoken);
        if sentences.is_empty() {
            debug!("Reply has nothing to speak");
            self.go_idle();
            return Ok(());
        }

        let mut first = true;
        for sentence in sentences {
            self.checkpoint()?;
            let handle = match self.synthesizer.synthesize(&sentence) {
                Ok(handle) => handle,
                Err(e) => {
                    self.speech_failed(e);
                    return Ok(());
                }
            };
            if !self.speech_active {
                self.speech_active = true;
                self.bus.publish(OutboundEvent::SpeechStarted { text: spoken.clone() });
            }

            match self.wait_playback(&handle)? {
                Ok(report) => {
                    let mut timings = self.timings.lock();
                    timings.synthesis.record(report.rendered_in);
                    if first {
                        timings
                            .total
                            .record(times.recognition + times.backend + report.rendered_in);
                    }
                    first = false;
                }
                Err(e) => {
                    self.speech_failed(e);
                    return Ok(());
                }
            }
        }

        self.speech_active = false;
        self.bus.publish(OutboundEvent::SpeechEnded { interrupted: false });
        self.go_idle();
        Ok(())
    }

    fn wait_playback(
        &mut self,
        handle: &PlaybackHandle,
    ) -> std::result::Result<std::result::Result<PlaybackReport, SynthesisError>, Abort> {
        let deadline = Instant::now() + self.config.synthesis.timeout() + SENTENCE_GUARD;
        let commands = self.commands.clone();

        loop {
            if let Err(abort) = self.checkpoint() {
                handle.stop();
                return Err(abort);
            }
            let ready = if self.config.wake.barge_in && !self.is_muted() {
                self.ready_channel()
            } else {
                never()
            };

            select! {
                recv(handle.done()) -> result => {
                    return Ok(result.unwrap_or_else(|_| Err(SynthesisError::Playback("playback worker exited".into()))));
                }
                recv(commands) -> command => {
                    if let Err(abort) = self.on_busy_command(command) {
                        handle.stop();
                        return Err(abort);
                    }
                }
                recv(ready) -> _ => {
                    if let Some(trigger) = self.barge_in() {
                        handle.stop();
                        return Err(Abort::BargeIn(trigger));
                    }
                }
                default(deadline.saturating_duration_since(Instant::now())) => {
                    handle.stop();
                    return Ok(Err(SynthesisError::Timeout));
                }
            }
        }
    }

    /// Feed frames heard while speaking to the wake detector
    fn barge_in(&mut self) -> Option<WakeTrigger> {
        let frames = self.frames.drain();
        if self.frames.is_finished() {
            self.source_done = true;
        }
        self.detect_wake(frames)
    }

    /// Frames after the detecting one are kept for the capture that follows
    fn detect_wake(&mut self, frames: Vec<AudioFrame>) -> Option<WakeTrigger> {
        let mut frames = frames.into_iter();
        while let Some(frame) = frames.next() {
            if self.wake.feed(&frame) {
                self.carry = frames.collect();
                let evidence = self.wake.last_detection().unwrap_or_default();
                return Some(WakeTrigger::WakeWord { evidence });
            }
        }
        None
    }

    /// The reply is already in memory; only the voice failed
    fn speech_failed(&mut self, error: SynthesisError) {
        if self.speech_active {
            self.speech_active = false;
            self.bus.publish(OutboundEvent::SpeechEnded { interrupted: false });
        }
        self.fail::<()>(ErrorKind::Synthesis, error.to_string());
    }

    /// Wait for a helper's answer while serving commands
    fn wait_for<T>(&mut self, rx: &Receiver<T>, timeout: Duration) -> std::result::Result<Waited<T>, Abort> {
        let deadline = Instant::now() + timeout;
        let commands = self.commands.clone();
        loop {
            self.checkpoint()?;
            select! {
                recv(rx) -> result => {
                    return Ok(match result {
                        Ok(value) => Waited::Done(value),
                        Err(_) => Waited::Lost,
                    });
                }
                recv(commands) -> command => self.on_busy_command(command)?,
                default(deadline.saturating_duration_since(Instant::now())) => return Ok(Waited::TimedOut),
            }
        }
    }

    /// Commands arriving mid-cycle
    fn on_busy_command(
        &mut self,
        command: std::result::Result<EngineCommand, RecvError>,
    ) -> std::result::Result<(), Abort> {
        let command = match command {
            Ok(command) => command,
            Err(_) => return Err(Abort::Shutdown),
        };
        match command {
            EngineCommand::Interrupt => {
                // The flag is gone when a checkpoint already acted on this interrupt
                if self.shared.interrupt.swap(false, Ordering::SeqCst) {
                    return Err(Abort::Interrupt);
                }
                debug!("Stale interrupt ignored");
            }
            EngineCommand::Shutdown => {
                info!("Shutdown requested mid-cycle");
                self.farewell_due = true;
                return Err(Abort::Shutdown);
            }
            EngineCommand::Mute => self.set_muted(true),
            EngineCommand::Unmute => self.set_muted(false),
            EngineCommand::Activate => debug!("Activate ignored while {}", self.state()),
            deferred => {
                debug!("Deferring {:?} until idle", deferred);
                self.deferred.push(deferred);
            }
        }
        Ok(())
    }

    /// Interrupt flag check between and during stages
    fn checkpoint(&self) -> std::result::Result<(), Abort> {
        if self.shared.interrupt.swap(false, Ordering::SeqCst) {
            return Err(Abort::Interrupt);
        }
        Ok(())
    }

    /// Interrupted -> Idle. A barge-in keeps the audio that follows the wake word.
    fn unwind_interrupt(&mut self, keep_audio: bool) {
        self.capturer.cancel();
        let from = self.state();
        if from.is_idle() {
            return;
        }
        info!("Interrupted while {}", from);
        self.transition(EngineState::Interrupted);
        if self.speech_active {
            self.speech_active = false;
            self.bus.publish(OutboundEvent::SpeechEnded { interrupted: true });
        }
        if keep_audio {
            self.transition(EngineState::Idle);
        } else {
            self.go_idle();
        }
    }

    /// Drop audio heard during the cycle, then announce Idle. Frames pushed
    /// after the announcement belong to the next cycle.
    fn go_idle(&mut self) {
        self.carry.clear();
        let stale = self.frames.discard();
        if stale > 0 {
            debug!("Discarded {} stale frames", stale);
        }
        if self.frames.is_finished() {
            self.source_done = true;
        }
        self.transition(EngineState::Idle);
    }

    /// Back in Idle: apply what waited for a quiet moment
    fn settle(&mut self) {
        self.wake.reset();
        self.shared.interrupt.store(false, Ordering::SeqCst);

        for command in std::mem::take(&mut self.deferred) {
            match command {
                EngineCommand::UpdateSettings(settings) => self.apply_settings(*settings),
                EngineCommand::ClearHistory => self.conversation.clear(),
                other => debug!("Dropping deferred {:?}", other),
            }
        }
        debug!("{}", self.timings.lock().stats().summary());
    }

    /// Apply all of `settings` or none of it
    fn apply_settings(&mut self, mut settings: EngineSettings) {
        if let Err(e) = settings.validate() {
            warn!("Rejected settings: {}", e);
            self.bus.publish(OutboundEvent::error(ErrorKind::Settings, e.to_string()));
            return;
        }
        let wake = match (self.scorer_factory)(&settings.wake)
            .and_then(|scorer| WakeWordDetector::new(&settings.wake, scorer))
        {
            Ok(wake) => wake,
            Err(e) => {
                warn!("Rejected settings: {}", e);
                self.bus.publish(OutboundEvent::error(ErrorKind::Settings, e.to_string()));
                return;
            }
        };

        self.wake = wake;
        settings.llm = settings.llm.with_host_tuning();
        if self.custom_detector {
            self.capturer.set_config(settings.capture.clone());
        } else {
            self.capturer = SpeechCapturer::new(settings.capture.clone());
        }
        self.conversation.update_config(settings.llm.clone());
        self.synthesizer.configure(&settings.voice);
        self.config.apply_settings(settings);
        info!("Settings updated (wake word '{}')", self.config.wake.wake_word);
    }

    fn set_muted(&mut self, muted: bool) {
        if self.shared.muted.swap(muted, Ordering::SeqCst) != muted {
            info!("{}", if muted { "Muted" } else { "Unmuted" });
            if !muted {
                self.wake.reset();
            }
            self.bus.publish(OutboundEvent::MuteChanged { muted });
        }
    }

    /// Record a recoverable failure and return to Idle
    fn fail<T>(&mut self, kind: ErrorKind, message: impl Into<String>) -> Option<T> {
        let message = message.into();
        warn!("{} failed: {}", kind, message);
        self.bus.publish(OutboundEvent::error(kind, message));
        self.go_idle();
        None
    }

    fn transition(&mut self, to: EngineState) {
        let from = std::mem::replace(&mut *self.shared.state.write(), to);
        if from != to {
            debug!("State {} -> {}", from, to);
            self.bus.publish(OutboundEvent::StateChanged { from, to });
        }
    }

    fn state(&self) -> EngineState {
        *self.shared.state.read()
    }

    fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::SeqCst)
    }

    /// Frame signal, or a channel that never fires once the source ended
    fn ready_channel(&self) -> Receiver<()> {
        if self.source_done {
            never()
        } else {
            self.frames.ready().clone()
        }
    }

    fn stop(&mut self) {
        info!("Engine stopping");
        if self.farewell_due {
            if let Some(farewell) = self.config.cues.farewell.clone() {
                self.say_farewell(&farewell);
            }
        }
        self.source.stop();
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }
        info!("Session latency: {}", self.timings.lock().stats().summary());
        self.shared.running.store(false, Ordering::SeqCst);
        self.bus.close(OutboundEvent::EngineStopped);
    }
}

impl Orchestrator {
    /// Last words; nothing can interrupt them
    fn say_farewell(&self, text: &str) {
        match self.synthesizer.synthesize(text) {
            Ok(handle) => match handle.done().recv_timeout(CUE_GUARD) {
                Ok(Ok(_)) => debug!("Farewell spoken"),
                Ok(Err(e)) => warn!("Farewell failed: {}", e),
                Err(_) => {
                    warn!("Farewell took longer than {:?}", CUE_GUARD);
                    handle.stop();
                }
            },
            Err(e) => warn!("Farewell not spoken: {}", e),
        }
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state())
            .field("muted", &self.is_muted())
            .field("source_done", &self.source_done)
            .finish()
    }
}

/// Assembles an engine from a config and optional collaborator overrides.
/// Anything not supplied is built from the config.
pub struct OrchestratorBuilder {
    config: EngineConfig,
    source: Option<Box<dyn AudioFrameSource>>,
    scorer_factory: Option<ScorerFactory>,
    speech_detector: Option<Box<dyn SpeechDetector>>,
    recognizer: Option<Arc<dyn Recognizer>>,
    backend: Option<Arc<dyn AiBackend>>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    probe: Option<Box<dyn MetricsProbe>>,
    monitor: bool,
}

impl OrchestratorBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            source: None,
            scorer_factory: None,
            speech_detector: None,
            recognizer: None,
            backend: None,
            synthesizer: None,
            probe: None,
            monitor: true,
        }
    }

    /// Set the complete configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_source(mut self, source: impl AudioFrameSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Use `factory` to build wake-word scorers, now and on settings updates
    pub fn with_scorer_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&WakeConfig) -> std::result::Result<Box<dyn KeywordScorer>, WakeError> + Send + 'static,
    {
        self.scorer_factory = Some(Box::new(factory));
        self
    }

    pub fn with_speech_detector(mut self, detector: Box<dyn SpeechDetector>) -> Self {
        self.speech_detector = Some(detector);
        self
    }

    pub fn with_recognizer(mut self, recognizer: Arc<dyn Recognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn AiBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn with_probe(mut self, probe: Box<dyn MetricsProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Run without the performance monitor
    pub fn without_monitor(mut self) -> Self {
        self.monitor = false;
        self
    }

    /// Validate, build every collaborator, open the audio source and start
    /// the engine. Any failure here is returned before the engine ever
    /// leaves Idle.
    pub fn start(self) -> Result<EngineHandle> {
        let mut config = self.config;
        config.validate()?;
        config.llm = config.llm.with_host_tuning();

        let scorer_factory = match self.scorer_factory {
            Some(factory) => factory,
            None => {
                let frame_len = config.audio.frame_len;
                let sample_rate = config.audio.sample_rate;
                Box::new(move |wake: &WakeConfig| scorer_for(wake, frame_len, sample_rate)) as ScorerFactory
            }
        };
        let wake = WakeWordDetector::new(&config.wake, scorer_factory(&config.wake)?)?;

        let custom_detector = self.speech_detector.is_some();
        let capturer = match self.speech_detector {
            Some(detector) => SpeechCapturer::with_detector(config.capture.clone(), detector),
            None => SpeechCapturer::new(config.capture.clone()),
        };

        let recognizer: Arc<dyn Recognizer> = match self.recognizer {
            Some(recognizer) => recognizer,
            None => default_recognizer(&config.recognition)?,
        };
        let backend: Arc<dyn AiBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(
                OllamaBackend::new(&config.llm.endpoint).map_err(|e| ParleyError::Conversation(e.to_string()))?,
            ),
        };
        let synthesizer: Arc<dyn Synthesizer> = match self.synthesizer {
            Some(synthesizer) => synthesizer,
            None => default_synthesizer(&config.synthesis),
        };
        let conversation = Arc::new(ConversationEngine::new(backend, config.llm.clone()));

        let mut source: Box<dyn AudioFrameSource> = match self.source {
            Some(source) => source,
            None => default_source(&config)?,
        };
        let (writer, frames) = FrameBuffer::new(config.audio.buffer_frames);
        if let Err(e) = source.start(writer) {
            error!("Audio source failed to start: {}", e);
            return Err(e.into());
        }

        let bus = EventBus::new(config.events.performance_backlog);
        let monitor = if self.monitor {
            let probe = self
                .probe
                .unwrap_or_else(|| Box::new(SystemProbe::new(config.monitor.gpu)) as Box<dyn MetricsProbe>);
            Some(PerformanceMonitor::start(&config.monitor, probe, bus.clone())?)
        } else {
            None
        };
        let readings = monitor.as_ref().map(PerformanceMonitor::readings);

        let shared = Arc::new(Shared {
            state: RwLock::new(EngineState::Idle),
            muted: AtomicBool::new(false),
            interrupt: AtomicBool::new(false),
            running: AtomicBool::new(true),
        });
        let timings = Arc::new(Mutex::new(PipelineTimings::new(TIMING_WINDOW)));
        let (command_tx, command_rx) = unbounded();

        let orchestrator = Orchestrator {
            shutdown_phrases: config.shutdown_matcher(),
            config,
            source,
            frames,
            carry: Vec::new(),
            source_done: false,
            wake,
            scorer_factory,
            capturer,
            custom_detector,
            recognizer,
            conversation: Arc::clone(&conversation),
            synthesizer,
            commands: command_rx,
            bus: bus.clone(),
            shared: Arc::clone(&shared),
            timings: Arc::clone(&timings),
            monitor,
            deferred: Vec::new(),
            speech_active: false,
            farewell_due: false,
        };

        let worker = thread::Builder::new()
            .name("orchestrator".into())
            .spawn(move || orchestrator.run())
            .map_err(|e| ParleyError::Orchestrator(format!("failed to spawn orchestrator: {}", e)))?;

        Ok(EngineHandle {
            commands: command_tx,
            bus,
            shared,
            conversation,
            timings,
            readings,
            worker: Arc::new(Mutex::new(Some(worker))),
        })
    }
}

fn default_recognizer(config: &RecognitionConfig) -> Result<Arc<dyn Recognizer>> {
    match config.provider {
        RecognitionProvider::Http => Ok(Arc::new(crate::speech::HttpRecognizer::new(config)?)),
        #[cfg(feature = "whisper")]
        RecognitionProvider::Whisper => Ok(Arc::new(crate::speech::WhisperRecognizer::new(config)?)),
        #[cfg(not(feature = "whisper"))]
        RecognitionProvider::Whisper => Err(ParleyError::Config(
            "local recognition needs the `whisper` feature".into(),
        )),
    }
}

fn default_synthesizer(config: &SynthesisConfig) -> Arc<dyn Synthesizer> {
    let voice = Arc::new(CommandVoice::new(config.clone()));
    #[cfg(feature = "audio-io")]
    let sink: Arc<dyn crate::speech::AudioSink> = Arc::new(crate::audio::SpeakerSink::new(None));
    #[cfg(not(feature = "audio-io"))]
    let sink: Arc<dyn crate::speech::AudioSink> = Arc::new(crate::speech::TimedSink::new());
    Arc::new(SinkSynthesizer::new(voice, sink, config.voice.clone()))
}

#[cfg(feature = "audio-io")]
fn default_source(config: &EngineConfig) -> Result<Box<dyn AudioFrameSource>> {
    Ok(Box::new(crate::audio::MicrophoneSource::new(
        config.audio.input_device.clone(),
        config.audio.sample_rate,
        config.audio.frame_len,
    )))
}

#[cfg(not(feature = "audio-io"))]
fn default_source(_config: &EngineConfig) -> Result<Box<dyn AudioFrameSource>> {
    Err(ParleyError::AudioDevice(
        "no audio source: build with the `audio-io` feature or supply a WAV input".into(),
    ))
}
