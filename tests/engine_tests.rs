//! End-to-end tests for the Parley engine
//!
//! Every collaborator is scripted: frames are pushed by hand, the wake word
//! is a marker sample value, and recognition, backend and speech replies are
//! canned. Nothing here touches audio hardware or the network.

use parking_lot::Mutex;
use parley::audio::{AudioError, AudioFrame, AudioFrameSource, CaptureConfig, DiscardReason, FrameWriter, Utterance};
use parley::llm::{AiBackend, BackendError, BackendParams, LLMConfig, TuningPreset};
use parley::monitor::{MetricsProbe, MonitorError, PerformanceSample};
use parley::speech::{PlaybackHandle, PlaybackReport, RecognitionError, Recognizer, SynthesisError, Synthesizer};
use parley::wake::{KeywordScorer, WakeConfig};
use parley::{
    CueConfig, EngineConfig, EngineHandle, EngineSettings, EngineState, ErrorKind, OrchestratorBuilder, OutboundEvent,
    ParleyError, Subscription, WakeTrigger,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAKE_LEVEL: f32 = 0.9;
const SPEECH_LEVEL: f32 = 0.3;
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

// 10ms frames at 16kHz
fn frame(level: f32) -> AudioFrame {
    AudioFrame::new(vec![level; 160], 16000, Duration::ZERO)
}

/// Scores 1.0 for frames carrying the wake marker
struct MarkerScorer;

impl KeywordScorer for MarkerScorer {
    fn score(&mut self, frame: &AudioFrame) -> f32 {
        if frame.samples().first() == Some(&WAKE_LEVEL) {
            1.0
        } else {
            0.0
        }
    }
}

/// Test-side handle to the frame writer
#[derive(Clone, Default)]
struct Feeder {
    writer: Arc<Mutex<Option<FrameWriter>>>,
}

impl Feeder {
    fn push(&self, frames: impl IntoIterator<Item = AudioFrame>) {
        if let Some(writer) = self.writer.lock().as_ref() {
            for frame in frames {
                writer.push(frame);
            }
        }
    }

    /// Speech followed by enough silence to end the capture
    fn say(&self, speech_frames: usize) {
        let speech = std::iter::repeat_with(|| frame(SPEECH_LEVEL)).take(speech_frames);
        let silence = std::iter::repeat_with(|| frame(0.0)).take(10);
        self.push(speech.chain(silence));
    }

    fn wake_and_say(&self, speech_frames: usize) {
        self.push([frame(WAKE_LEVEL)]);
        self.say(speech_frames);
    }

    fn close(&self) {
        if let Some(writer) = self.writer.lock().take() {
            writer.close();
        }
    }

    /// The device goes away
    fn fail(&self, reason: &str) {
        if let Some(writer) = self.writer.lock().take() {
            writer.fail(reason);
        }
    }
}

struct FeedSource {
    feeder: Feeder,
}

impl AudioFrameSource for FeedSource {
    fn start(&mut self, writer: FrameWriter) -> Result<(), AudioError> {
        *self.feeder.writer.lock() = Some(writer);
        Ok(())
    }

    fn stop(&mut self) {
        self.feeder.writer.lock().take();
    }

    fn sample_rate(&self) -> u32 {
        16000
    }
}

/// Replays queued results, then answers "what time is it"
#[derive(Default)]
struct ScriptedRecognizer {
    replies: Mutex<VecDeque<Result<String, RecognitionError>>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl ScriptedRecognizer {
    fn queue(&self, reply: Result<&str, RecognitionError>) {
        self.replies.lock().push_back(reply.map(str::to_string));
    }
}

impl Recognizer for ScriptedRecognizer {
    fn recognize(&self, utterance: Utterance) -> Result<String, RecognitionError> {
        assert!(utterance.speech_frames() > 0);
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        thread::sleep(delay);
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok("what time is it".to_string()))
    }
}

struct ScriptedBackend {
    reply: String,
    delay: Duration,
    failure: Option<BackendError>,
    params: Mutex<Vec<BackendParams>>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    fn new(reply: &str, delay: Duration) -> Self {
        Self {
            reply: reply.to_string(),
            delay,
            failure: None,
            params: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    fn failing(error: BackendError) -> Self {
        Self {
            failure: Some(error),
            ..Self::new("", Duration::ZERO)
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AiBackend for ScriptedBackend {
    fn query(&self, _prompt: &str, params: &BackendParams, _timeout: Duration) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.params.lock().push(params.clone());
        thread::sleep(self.delay);
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(self.reply.clone()),
        }
    }
}

/// "Plays" each sentence for a fixed time, stopping early when asked
struct ScriptedSynth {
    per_sentence: Duration,
    fail: bool,
    spoken: Mutex<Vec<String>>,
}

impl ScriptedSynth {
    fn new(per_sentence: Duration) -> Self {
        Self {
            per_sentence,
            fail: false,
            spoken: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Duration::ZERO)
        }
    }
}

impl Synthesizer for ScriptedSynth {
    fn synthesize(&self, text: &str) -> Result<PlaybackHandle, SynthesisError> {
        if self.fail {
            return Err(SynthesisError::VoiceUnavailable("no voice installed".into()));
        }
        self.spoken.lock().push(text.to_string());
        let (handle, control) = PlaybackHandle::pair();
        let length = self.per_sentence;
        thread::spawn(move || {
            let started = Instant::now();
            while started.elapsed() < length && !control.is_stopped() {
                thread::sleep(Duration::from_millis(2));
            }
            let report = PlaybackReport {
                rendered_in: Duration::from_millis(1),
                played: started.elapsed(),
                stopped: control.is_stopped(),
            };
            control.finish(Ok(report));
        });
        Ok(handle)
    }
}

/// Rising CPU reading per sample
struct CountingProbe(f32);

impl MetricsProbe for CountingProbe {
    fn sample(&mut self) -> Result<PerformanceSample, MonitorError> {
        self.0 += 1.0;
        Ok(PerformanceSample::new(self.0, 30.0))
    }
}

fn test_config() -> EngineConfig {
    let mut capture = CaptureConfig::default()
        .with_trailing_silence(50)
        .with_onset_timeout(300)
        .with_max_utterance(3000);
    capture.min_speech_ms = 30;

    EngineConfig::new()
        .with_wake(WakeConfig::default().with_threshold(1.0).with_window(1).with_refractory(0))
        .with_capture(capture)
        .with_llm(LLMConfig::default().with_timeout(Duration::from_secs(5)))
        .with_cues(CueConfig::silent())
}

struct Setup {
    config: EngineConfig,
    recognizer: Arc<ScriptedRecognizer>,
    backend: Arc<ScriptedBackend>,
    synth: Arc<ScriptedSynth>,
    probe: Option<Box<dyn MetricsProbe>>,
    wake_words: Arc<Mutex<Vec<String>>>,
}

impl Setup {
    fn new() -> Self {
        Self {
            config: test_config(),
            recognizer: Arc::new(ScriptedRecognizer::default()),
            backend: Arc::new(ScriptedBackend::new("It is noon. Anything else?", Duration::from_millis(20))),
            synth: Arc::new(ScriptedSynth::new(Duration::from_millis(10))),
            probe: None,
            wake_words: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn backend(mut self, backend: ScriptedBackend) -> Self {
        self.backend = Arc::new(backend);
        self
    }

    fn synth(mut self, synth: ScriptedSynth) -> Self {
        self.synth = Arc::new(synth);
        self
    }

    fn start(self) -> Engine {
        let feeder = Feeder::default();
        let wake_words = Arc::clone(&self.wake_words);
        let mut builder = OrchestratorBuilder::new(self.config)
            .with_source(FeedSource { feeder: feeder.clone() })
            .with_scorer_factory(move |wake: &WakeConfig| {
                wake_words.lock().push(wake.wake_word.clone());
                Ok(Box::new(MarkerScorer) as Box<dyn KeywordScorer>)
            })
            .with_recognizer(self.recognizer.clone())
            .with_backend(self.backend.clone())
            .with_synthesizer(self.synth.clone());
        builder = match self.probe {
            Some(probe) => builder.with_probe(probe),
            None => builder.without_monitor(),
        };

        let handle = builder.start().expect("engine should start");
        let (_, events) = handle.subscribe();
        Engine {
            handle,
            events,
            feeder,
            recognizer: self.recognizer,
            backend: self.backend,
            synth: self.synth,
            wake_words: self.wake_words,
        }
    }
}

struct Engine {
    handle: EngineHandle,
    events: Subscription,
    feeder: Feeder,
    recognizer: Arc<ScriptedRecognizer>,
    backend: Arc<ScriptedBackend>,
    synth: Arc<ScriptedSynth>,
    wake_words: Arc<Mutex<Vec<String>>>,
}

impl Engine {
    /// Next pipeline event, skipping performance updates
    fn next(&self) -> OutboundEvent {
        loop {
            let event = self
                .events
                .recv_timeout(EVENT_TIMEOUT)
                .expect("timed out waiting for an event");
            if !event.is_performance_update() {
                return event;
            }
        }
    }

    /// Events up to and including the first one matching `done`
    fn until(&self, done: impl Fn(&OutboundEvent) -> bool) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        loop {
            let event = self.next();
            let finished = done(&event);
            events.push(event);
            if finished {
                return events;
            }
        }
    }

    fn until_state(&self, state: EngineState) -> Vec<OutboundEvent> {
        self.until(|e| matches!(e, OutboundEvent::StateChanged { to, .. } if *to == state))
    }

    fn until_stopped(&self) -> Vec<OutboundEvent> {
        self.until(|e| matches!(e, OutboundEvent::EngineStopped))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.handle.shutdown();
        let _ = self.handle.join();
    }
}

fn transitions(events: &[OutboundEvent]) -> Vec<(EngineState, EngineState)> {
    events
        .iter()
        .filter_map(|e| match e {
            OutboundEvent::StateChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

fn names(events: &[OutboundEvent]) -> Vec<&'static str> {
    events.iter().map(OutboundEvent::name).collect()
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

use EngineState::*;

#[test]
fn test_full_cycle_event_order() {
    let engine = Setup::new().start();
    engine.feeder.wake_and_say(10);

    let events = engine.until_state(Idle);
    assert_eq!(
        names(&events),
        vec![
            "wake_detected",
            "state_changed",
            "state_changed",
            "utterance_captured",
            "state_changed",
            "recognition_result",
            "state_changed",
            "conversation_turn",
            "state_changed",
            "speech_started",
            "speech_ended",
            "state_changed",
        ]
    );
    assert_eq!(
        transitions(&events),
        vec![
            (Idle, Listening),
            (Listening, Capturing),
            (Capturing, Recognizing),
            (Recognizing, Thinking),
            (Thinking, Speaking),
            (Speaking, Idle),
        ]
    );
    assert!(matches!(
        events[0],
        OutboundEvent::WakeDetected {
            trigger: WakeTrigger::WakeWord { .. }
        }
    ));
    assert!(events.contains(&OutboundEvent::RecognitionResult {
        text: "what time is it".into()
    }));
    assert!(events.contains(&OutboundEvent::SpeechEnded { interrupted: false }));

    let history = engine.handle.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].user_text, "what time is it");
    assert_eq!(history[0].assistant_text, "It is noon. Anything else?");
    assert!(engine.synth.spoken.lock().join(" ").contains("It is noon."));
    assert_eq!(engine.handle.state(), Idle);

    let stats = engine.handle.stats();
    assert_eq!(stats.pipeline.recognition.count, 1);
    assert_eq!(stats.pipeline.backend.count, 1);
    assert_eq!(stats.pipeline.total.count, 1);
    assert!(stats.pipeline.synthesis.count >= 1);
}

#[test]
fn test_reasoning_is_not_spoken() {
    let engine = Setup::new()
        .backend(ScriptedBackend::new(
            "<think>the user wants the time</think>It is noon.",
            Duration::ZERO,
        ))
        .start();
    engine.feeder.wake_and_say(10);
    engine.until_state(Idle);

    let spoken = engine.synth.spoken.lock().join(" ");
    assert!(!spoken.contains("think"));
    assert_eq!(engine.handle.history()[0].assistant_text, "It is noon.");
}

#[test]
fn test_interrupt_while_thinking_drops_late_reply() {
    let engine = Setup::new()
        .backend(ScriptedBackend::new("Too late.", Duration::from_millis(800)))
        .start();
    engine.feeder.wake_and_say(10);
    engine.until_state(Thinking);

    let interrupted_at = Instant::now();
    engine.handle.interrupt().unwrap();
    let events = engine.until_state(Idle);
    assert!(interrupted_at.elapsed() < Duration::from_millis(400));
    assert_eq!(transitions(&events), vec![(Thinking, Interrupted), (Interrupted, Idle)]);
    assert!(!names(&events).contains(&"speech_ended"));

    // Let the abandoned reply arrive; it must not reach memory
    thread::sleep(Duration::from_millis(1000));
    assert!(engine.handle.history().is_empty());
    assert!(engine.events.try_recv().is_err());

    // The engine is not left busy
    engine.feeder.wake_and_say(10);
    let events = engine.until_state(Idle);
    assert!(names(&events).contains(&"conversation_turn"));
    assert_eq!(engine.backend.calls(), 2);
    assert_eq!(engine.handle.history().len(), 1);
}

#[test]
fn test_interrupt_while_speaking_stops_playback() {
    let engine = Setup::new().synth(ScriptedSynth::new(Duration::from_secs(5))).start();
    engine.feeder.wake_and_say(10);
    engine.until(|e| matches!(e, OutboundEvent::SpeechStarted { .. }));

    let interrupted_at = Instant::now();
    engine.handle.interrupt().unwrap();
    let events = engine.until_state(Idle);
    assert!(interrupted_at.elapsed() < Duration::from_millis(500));
    assert_eq!(
        events,
        vec![
            OutboundEvent::StateChanged {
                from: Speaking,
                to: Interrupted
            },
            OutboundEvent::SpeechEnded { interrupted: true },
            OutboundEvent::StateChanged {
                from: Interrupted,
                to: Idle
            },
        ]
    );
    // The turn was complete before speaking began
    assert_eq!(engine.handle.history().len(), 1);
}

#[test]
fn test_interrupt_while_idle_is_ignored() {
    let engine = Setup::new().start();
    engine.handle.interrupt().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(engine.events.try_recv().is_err());
    assert_eq!(engine.handle.state(), Idle);

    // A stale interrupt must not cancel the next cycle
    engine.feeder.wake_and_say(10);
    let events = engine.until_state(Idle);
    assert!(names(&events).contains(&"conversation_turn"));
}

#[test]
fn test_silence_after_wake_is_discarded() {
    let engine = Setup::new().start();
    engine.feeder.push([frame(WAKE_LEVEL)]);
    engine.feeder.push((0..40).map(|_| frame(0.0)));

    let events = engine.until_state(Idle);
    assert!(events.contains(&OutboundEvent::UtteranceDiscarded {
        reason: DiscardReason::NoSpeech
    }));
    assert_eq!(
        transitions(&events),
        vec![(Idle, Listening), (Listening, Capturing), (Capturing, Idle)]
    );
    let discarded = events
        .iter()
        .position(|e| matches!(e, OutboundEvent::UtteranceDiscarded { .. }))
        .expect("discard reported");
    assert_eq!(
        events[discarded - 1],
        OutboundEvent::StateChanged {
            from: Listening,
            to: Capturing
        }
    );
    assert_eq!(engine.recognizer.calls.load(Ordering::SeqCst), 0);

    // Too little speech to count
    engine.feeder.push([frame(WAKE_LEVEL)]);
    engine.feeder.say(2);
    let events = engine.until_state(Idle);
    assert!(events.contains(&OutboundEvent::UtteranceDiscarded {
        reason: DiscardReason::TooShort
    }));
    assert_eq!(
        transitions(&events),
        vec![(Idle, Listening), (Listening, Capturing), (Capturing, Idle)]
    );
    assert_eq!(engine.recognizer.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_recognition_failure_returns_to_idle() {
    let engine = Setup::new().start();
    engine
        .recognizer
        .queue(Err(RecognitionError::Provider("service offline".into())));
    engine.feeder.wake_and_say(10);

    let events = engine.until_state(Idle);
    let error = events
        .iter()
        .position(|e| matches!(e, OutboundEvent::ErrorOccurred { kind: ErrorKind::Recognition, .. }))
        .expect("recognition error reported");
    assert_eq!(error, events.len() - 2);
    assert_eq!(transitions(&events).last(), Some(&(Recognizing, Idle)));
    assert_eq!(engine.backend.calls(), 0);

    // Blank text counts as unintelligible
    engine.recognizer.queue(Ok("   "));
    engine.feeder.wake_and_say(10);
    let events = engine.until_state(Idle);
    assert!(events
        .iter()
        .any(|e| matches!(e, OutboundEvent::ErrorOccurred { kind: ErrorKind::Recognition, .. })));
    assert!(!names(&events).contains(&"recognition_result"));
    assert_eq!(engine.backend.calls(), 0);
}

#[test]
fn test_synthesis_failure_keeps_turn() {
    let engine = Setup::new().synth(ScriptedSynth::failing()).start();
    engine.feeder.wake_and_say(10);

    let events = engine.until_state(Idle);
    assert!(names(&events).contains(&"conversation_turn"));
    assert!(!names(&events).contains(&"speech_started"));
    assert!(events
        .iter()
        .any(|e| matches!(e, OutboundEvent::ErrorOccurred { kind: ErrorKind::Synthesis, .. })));
    assert_eq!(
        &transitions(&events)[3..],
        &[(Recognizing, Thinking), (Thinking, Speaking), (Speaking, Idle)]
    );
    assert_eq!(engine.handle.history().len(), 1);
}

fn error_kinds(events: &[OutboundEvent]) -> Vec<ErrorKind> {
    events
        .iter()
        .filter_map(|e| match e {
            OutboundEvent::ErrorOccurred { kind, .. } => Some(*kind),
            _ => None,
        })
        .collect()
}

#[test]
fn test_backend_failure_leaves_memory_untouched() {
    let engine = Setup::new()
        .backend(ScriptedBackend::failing(BackendError::Unreachable("connection refused".into())))
        .start();
    engine.feeder.wake_and_say(10);

    let events = engine.until_state(Idle);
    assert_eq!(error_kinds(&events), vec![ErrorKind::Backend]);
    assert_eq!(
        &transitions(&events)[3..],
        &[(Recognizing, Thinking), (Thinking, Idle)]
    );
    // The error comes before the return to Idle
    assert!(matches!(events[events.len() - 2], OutboundEvent::ErrorOccurred { .. }));
    assert!(!names(&events).contains(&"conversation_turn"));
    assert!(engine.handle.history().is_empty());
    assert!(engine.synth.spoken.lock().is_empty());
}

#[test]
fn test_backend_timeout_returns_to_idle() {
    let mut setup = Setup::new().backend(ScriptedBackend::new("Far too slow.", Duration::from_secs(2)));
    setup.config.llm.timeout_ms = 100;
    let engine = setup.start();
    engine.feeder.wake_and_say(10);
    engine.until_state(Thinking);

    let waiting_since = Instant::now();
    let events = engine.until_state(Idle);
    assert!(waiting_since.elapsed() < Duration::from_millis(1000));
    assert_eq!(error_kinds(&events), vec![ErrorKind::Backend]);
    assert_eq!(transitions(&events), vec![(Thinking, Idle)]);
    assert!(engine.handle.history().is_empty());
}

#[test]
fn test_busy_backend_is_not_an_error() {
    let engine = Setup::new()
        .backend(ScriptedBackend::new("Slow answer.", Duration::from_millis(700)))
        .start();
    engine.feeder.wake_and_say(10);
    engine.until_state(Thinking);
    engine.handle.interrupt().unwrap();
    engine.until_state(Idle);

    // The abandoned query is still running on the backend
    engine.feeder.wake_and_say(10);
    let events = engine.until_state(Idle);
    assert!(error_kinds(&events).is_empty());
    assert!(!names(&events).contains(&"conversation_turn"));
    assert_eq!(transitions(&events).last(), Some(&(Thinking, Idle)));
    assert_eq!(engine.backend.calls(), 1);

    // Once it returns the engine answers again
    thread::sleep(Duration::from_millis(800));
    engine.feeder.wake_and_say(10);
    let events = engine.until_state(Idle);
    assert!(names(&events).contains(&"conversation_turn"));
    assert_eq!(engine.backend.calls(), 2);
    assert_eq!(engine.handle.history().len(), 1);
}

#[test]
fn test_interrupt_while_capturing() {
    let engine = Setup::new().start();
    engine.feeder.push([frame(WAKE_LEVEL)]);
    engine.feeder.push((0..10).map(|_| frame(SPEECH_LEVEL)));
    engine.until_state(Capturing);

    let interrupted_at = Instant::now();
    engine.handle.interrupt().unwrap();
    let events = engine.until_state(Idle);
    assert!(interrupted_at.elapsed() < Duration::from_millis(200));
    assert_eq!(transitions(&events), vec![(Capturing, Interrupted), (Interrupted, Idle)]);
    assert!(!names(&events).contains(&"utterance_captured"));
    assert_eq!(engine.recognizer.calls.load(Ordering::SeqCst), 0);

    // The rest of the interrupted sentence starts nothing
    engine.feeder.say(5);
    thread::sleep(Duration::from_millis(150));
    assert!(engine.events.try_recv().is_err());
}

#[test]
fn test_interrupt_while_recognizing() {
    let engine = Setup::new().start();
    *engine.recognizer.delay.lock() = Duration::from_millis(800);
    engine.feeder.wake_and_say(10);
    engine.until_state(Recognizing);

    let interrupted_at = Instant::now();
    engine.handle.interrupt().unwrap();
    let events = engine.until_state(Idle);
    assert!(interrupted_at.elapsed() < Duration::from_millis(400));
    assert_eq!(transitions(&events), vec![(Recognizing, Interrupted), (Interrupted, Idle)]);

    // The late transcript is dropped
    thread::sleep(Duration::from_millis(1000));
    assert!(engine.events.try_recv().is_err());
    assert_eq!(engine.backend.calls(), 0);
    assert!(engine.handle.history().is_empty());
}

#[test]
fn test_acknowledgement_and_farewell_are_spoken() {
    let mut setup = Setup::new();
    setup.config.cues = CueConfig::default();
    setup.config.cues.fallback = None;
    let engine = setup.start();
    let acknowledgement = CueConfig::default().acknowledgement.unwrap();
    let farewell = CueConfig::default().farewell.unwrap();
    let spoken_count = |line: &str| engine.synth.spoken.lock().iter().filter(|s| *s == line).count();

    engine.handle.activate().unwrap();
    assert!(wait_until(EVENT_TIMEOUT, || spoken_count(&acknowledgement) == 1));
    thread::sleep(Duration::from_millis(100));
    engine.feeder.say(10);
    let events = engine.until_state(Idle);
    assert!(names(&events).contains(&"conversation_turn"));
    // Cues are not reply speech
    assert_eq!(names(&events).iter().filter(|n| **n == "speech_started").count(), 1);
    assert_eq!(engine.synth.spoken.lock()[0], acknowledgement);

    engine.recognizer.queue(Ok("Quit."));
    engine.handle.activate().unwrap();
    assert!(wait_until(EVENT_TIMEOUT, || spoken_count(&acknowledgement) == 2));
    thread::sleep(Duration::from_millis(100));
    engine.feeder.say(10);
    engine.until_stopped();
    assert_eq!(engine.synth.spoken.lock().last(), Some(&farewell));
    assert_eq!(spoken_count(&farewell), 1);
}

#[test]
fn test_fallback_line_after_backend_failure() {
    let mut setup = Setup::new().backend(ScriptedBackend::failing(BackendError::Rejected("model not found".into())));
    setup.config.cues.fallback = Some("Sorry, I lost my train of thought.".into());
    let engine = setup.start();
    engine.feeder.wake_and_say(10);

    let events = engine.until_state(Idle);
    assert_eq!(error_kinds(&events), vec![ErrorKind::Backend]);
    assert_eq!(transitions(&events).last(), Some(&(Thinking, Idle)));
    assert!(!names(&events).contains(&"speech_started"));
    assert_eq!(
        *engine.synth.spoken.lock(),
        vec!["Sorry, I lost my train of thought.".to_string()]
    );
    assert!(engine.handle.history().is_empty());
}

#[test]
fn test_source_failure_reports_audio_error() {
    let engine = Setup::new().start();
    engine.feeder.fail("input device lost");

    let events = engine.until_stopped();
    assert_eq!(
        events,
        vec![
            OutboundEvent::ErrorOccurred {
                kind: ErrorKind::Audio,
                message: "input device lost".into()
            },
            OutboundEvent::EngineStopped,
        ]
    );
    engine.handle.join().unwrap();
}

#[test]
fn test_speed_preset_reaches_backend() {
    let mut setup = Setup::new();
    setup.config.llm.preset = TuningPreset::Speed;
    let engine = setup.start();
    engine.feeder.wake_and_say(10);
    engine.until_state(Idle);

    let params = engine.backend.params.lock();
    assert_eq!(params.len(), 1);
    assert_eq!(params[0].max_tokens, 128);
    assert_eq!(params[0].temperature, 0.3);
    assert!(params[0].n_threads.is_some());
}

#[test]
fn test_mute_ignores_wake_word_but_not_activate() {
    let engine = Setup::new().start();
    engine.handle.mute().unwrap();
    assert_eq!(engine.next(), OutboundEvent::MuteChanged { muted: true });
    assert!(engine.handle.is_muted());

    engine.feeder.wake_and_say(10);
    thread::sleep(Duration::from_millis(150));
    assert!(engine.events.try_recv().is_err());
    assert_eq!(engine.handle.state(), Idle);

    engine.handle.activate().unwrap();
    let events = engine.until_state(Listening);
    assert_eq!(
        events[0],
        OutboundEvent::WakeDetected {
            trigger: WakeTrigger::Manual
        }
    );
    engine.feeder.say(10);
    let events = engine.until_state(Idle);
    assert!(names(&events).contains(&"conversation_turn"));

    // Muting twice changes nothing
    engine.handle.mute().unwrap();
    engine.handle.unmute().unwrap();
    assert_eq!(engine.next(), OutboundEvent::MuteChanged { muted: false });
    assert!(!engine.handle.is_muted());
}

#[test]
fn test_settings_update() {
    let engine = Setup::new().start();
    assert_eq!(*engine.wake_words.lock(), vec!["jarvis"]);

    let mut rejected = EngineSettings::default();
    rejected.wake.threshold = 0.0;
    engine.handle.update_settings(rejected).unwrap();
    let event = engine.next();
    assert!(matches!(
        event,
        OutboundEvent::ErrorOccurred {
            kind: ErrorKind::Settings,
            ..
        }
    ));
    assert_eq!(engine.wake_words.lock().len(), 1);

    let mut settings = test_config().settings();
    settings.wake.wake_word = "computer".into();
    settings.llm.memory_window = 1;
    engine.handle.update_settings(settings).unwrap();
    assert!(wait_until(Duration::from_secs(2), || engine.wake_words.lock().len() == 2));
    assert_eq!(engine.wake_words.lock()[1], "computer");

    // The new memory window holds one turn
    for _ in 0..2 {
        engine.feeder.wake_and_say(10);
        engine.until_state(Idle);
    }
    assert_eq!(engine.handle.history().len(), 1);
}

#[test]
fn test_settings_update_waits_for_idle() {
    let engine = Setup::new()
        .backend(ScriptedBackend::new("Sure.", Duration::from_millis(300)))
        .start();
    engine.feeder.wake_and_say(10);
    engine.until_state(Thinking);

    let mut settings = test_config().settings();
    settings.wake.wake_word = "computer".into();
    engine.handle.update_settings(settings).unwrap();
    engine.handle.clear_history().unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(engine.wake_words.lock().len(), 1);

    engine.until_state(Idle);
    assert!(wait_until(Duration::from_secs(2), || {
        engine.wake_words.lock().len() == 2 && engine.handle.history().is_empty()
    }));
}

#[test]
fn test_shutdown_phrase_stops_engine() {
    let engine = Setup::new().start();
    engine.recognizer.queue(Ok("Shutdown!"));
    engine.feeder.wake_and_say(10);

    let events = engine.until_stopped();
    assert!(names(&events).contains(&"recognition_result"));
    assert!(!names(&events).contains(&"conversation_turn"));
    assert_eq!(transitions(&events).last(), Some(&(Recognizing, Idle)));
    assert_eq!(engine.backend.calls(), 0);

    assert!(engine.events.recv().is_none());
    engine.handle.join().unwrap();
    assert!(!engine.handle.is_running());
}

#[test]
fn test_shutdown_command_mid_cycle() {
    let engine = Setup::new()
        .backend(ScriptedBackend::new("Never heard.", Duration::from_secs(2)))
        .start();
    engine.feeder.wake_and_say(10);
    engine.until_state(Thinking);

    engine.handle.shutdown().unwrap();
    let events = engine.until_stopped();
    assert_eq!(transitions(&events), vec![(Thinking, Interrupted), (Interrupted, Idle)]);
    assert!(engine.events.is_closed());

    engine.handle.join().unwrap();
    assert!(matches!(engine.handle.activate(), Err(ParleyError::Channel(_))));
    assert!(engine.handle.history().is_empty());
}

#[test]
fn test_source_end_stops_engine() {
    let engine = Setup::new().start();
    engine.feeder.close();
    let events = engine.until_stopped();
    assert_eq!(events, vec![OutboundEvent::EngineStopped]);
    engine.handle.join().unwrap();
}

#[test]
fn test_barge_in_starts_new_cycle() {
    let engine = Setup::new().synth(ScriptedSynth::new(Duration::from_secs(5))).start();
    engine.feeder.wake_and_say(10);
    engine.until(|e| matches!(e, OutboundEvent::SpeechStarted { .. }));

    engine.feeder.wake_and_say(10);
    let events = engine.until_state(Idle);
    assert_eq!(
        events,
        vec![
            OutboundEvent::StateChanged {
                from: Speaking,
                to: Interrupted
            },
            OutboundEvent::SpeechEnded { interrupted: true },
            OutboundEvent::StateChanged {
                from: Interrupted,
                to: Idle
            },
        ]
    );

    let events = engine.until(|e| matches!(e, OutboundEvent::SpeechStarted { .. }));
    assert!(matches!(
        events[0],
        OutboundEvent::WakeDetected {
            trigger: WakeTrigger::WakeWord { .. }
        }
    ));
    assert!(names(&events).contains(&"utterance_captured"));
    assert_eq!(engine.backend.calls(), 2);
}

#[test]
fn test_subscribe_returns_snapshot_without_replay() {
    let engine = Setup::new().start();
    let (snapshot, _) = engine.handle.subscribe();
    assert_eq!(snapshot.state, Idle);
    assert!(!snapshot.muted);
    assert!(snapshot.latest_sample.is_none());

    engine.handle.mute().unwrap();
    engine.next();

    let (snapshot, late) = engine.handle.subscribe();
    assert!(snapshot.muted);
    assert!(late.try_recv().is_err());

    engine.handle.unmute().unwrap();
    assert_eq!(
        late.recv_timeout(EVENT_TIMEOUT).unwrap(),
        OutboundEvent::MuteChanged { muted: false }
    );
}

#[test]
fn test_slow_subscriber_keeps_newest_samples() {
    let mut setup = Setup::new();
    setup.config.monitor.interval_ms = 5;
    setup.config.events.performance_backlog = 2;
    setup.probe = Some(Box::new(CountingProbe(0.0)));
    let engine = setup.start();

    thread::sleep(Duration::from_millis(150));
    let samples: Vec<f32> = engine
        .events
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            OutboundEvent::PerformanceUpdate(sample) => Some(sample.cpu_percent),
            _ => None,
        })
        .collect();
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[1], samples[0] + 1.0);
    assert!(samples[0] > 2.0);
    assert!(engine.events.dropped_performance_updates() > 0);

    let snapshot = engine.handle.snapshot();
    assert!(snapshot.latest_sample.is_some());
    assert!(engine.handle.stats().resources.samples > 0);
}

#[test]
fn test_missing_input_file_fails_at_start() {
    let result = OrchestratorBuilder::new(test_config())
        .with_source(parley::audio::WavFileSource::new("/nonexistent/input.wav", 16000, 160))
        .with_recognizer(Arc::new(ScriptedRecognizer::default()))
        .with_backend(Arc::new(ScriptedBackend::new("unused", Duration::ZERO)))
        .with_synthesizer(Arc::new(ScriptedSynth::new(Duration::ZERO)))
        .without_monitor()
        .start();
    assert!(matches!(result, Err(ParleyError::AudioDevice(_))));
}

#[test]
fn test_wav_replay_with_manual_activation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("question.wav");
    let mut samples = vec![0.0f32; 16000 * 3 / 10];
    samples.extend(std::iter::repeat(SPEECH_LEVEL).take(16000 * 3 / 10));
    parley::audio::write_wav(&path, &samples, 16000, 1).unwrap();

    let mut config = test_config();
    config.capture.onset_timeout_ms = 1000;
    let source = parley::audio::WavFileSource::new(&path, 16000, 160).with_trailing_silence(Duration::from_millis(200));
    let backend = Arc::new(ScriptedBackend::new("Hello.", Duration::ZERO));
    let handle = OrchestratorBuilder::new(config)
        .with_source(source)
        .with_recognizer(Arc::new(ScriptedRecognizer::default()))
        .with_backend(backend.clone())
        .with_synthesizer(Arc::new(ScriptedSynth::new(Duration::from_millis(5))))
        .without_monitor()
        .start()
        .unwrap();
    let (_, events) = handle.subscribe();
    handle.activate().unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.recv_timeout(EVENT_TIMEOUT) {
        seen.push(event.name());
    }
    assert!(seen.contains(&"utterance_captured"));
    assert!(seen.contains(&"conversation_turn"));
    assert_eq!(seen.last(), Some(&"engine_stopped"));
    assert_eq!(backend.calls(), 1);
    handle.join().unwrap();
}
