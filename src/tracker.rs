use std::{
    fmt::Write as _,
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
};

use crate::{
    config::{Config, DisplayFlags, OriginEviction},
    enter_tracker, in_tracker,
    origin::{OriginTrie, Origins, RefKind},
    registry::{Registry, RegistrySnapshot},
    report::{CheckpointReport, FinalReport, LiveEntry, LiveReport, ObjectList},
    sink::{self, Sink},
    stack::{self, Frame, FrameList, StackCapture},
    NoInspector, ObjectId, ObjectInspector,
};

/// Asynchronous report requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    Live,
    Checkpoint,
    Final,
}

/// Everything guarded by the state lock.
#[derive(Default)]
struct State {
    registry: Registry,
    origins: Origins,
}

pub struct TrackerBuilder {
    config: Config,
    capture: Option<Box<dyn StackCapture>>,
    inspector: Option<Box<dyn ObjectInspector>>,
    sink: Option<Sink>,
}

impl TrackerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            capture: None,
            inspector: None,
            sink: None,
        }
    }

    pub fn capture(mut self, capture: impl StackCapture + 'static) -> Self {
        self.capture = Some(Box::new(capture));
        self
    }

    pub fn inspector(mut self, inspector: impl ObjectInspector + 'static) -> Self {
        self.inspector = Some(Box::new(inspector));
        self
    }

    pub fn sink(mut self, sink: impl Write + Send + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Capabilities the capture strategy lacks are switched off here, with a
    /// warning written to the sink.
    pub fn build(self) -> Tracker {
        let mut config = self.config;
        let capture = self.capture.unwrap_or_else(stack::default_capture);
        let mut sink = self.sink.unwrap_or_else(sink::stderr);
        for warning in config.restrict_to(capture.as_ref()) {
            let _ = writeln!(sink, "{warning}");
        }
        Tracker {
            config,
            capture,
            inspector: self.inspector.unwrap_or_else(|| Box::new(NoInspector)),
            state: Mutex::new(State::default()),
            output: Mutex::new(sink),
            final_reported: AtomicBool::new(false),
        }
    }
}

/// Lifecycle tracking context. Event notifications from the interception
/// boundary go in, reports come out on the diagnostic sink.
pub struct Tracker {
    config: Config,
    capture: Box<dyn StackCapture>,
    inspector: Box<dyn ObjectInspector>,
    state: Mutex<State>,
    output: Mutex<Sink>,
    final_reported: AtomicBool,
}

impl Tracker {
    pub fn builder(config: Config) -> TrackerBuilder {
        TrackerBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        }
    }

    fn write(&self, text: &str) {
        let mut output = match self.output.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        };
        let _ = output.write_all(text.as_bytes());
        let _ = output.flush();
    }

    pub(crate) fn warn(&self, message: &str) {
        self.write(&format!("{message}\n"));
    }

    /// Captures a stack only if it is going to be printed or traced.
    fn frames(&self, line_shown: bool, traced: bool) -> Vec<Frame> {
        let printed = line_shown && self.config.shows(DisplayFlags::BACKTRACE);
        if printed || traced {
            self.capture.capture()
        } else {
            vec![]
        }
    }

    /// Line and backtrace go out as a single write under the output lock.
    fn emit(&self, line: std::fmt::Arguments<'_>, frames: &[Frame]) {
        let mut text = String::new();
        let _ = writeln!(text, "{line}");
        if self.config.shows(DisplayFlags::BACKTRACE) {
            let _ = write!(text, "{}", FrameList(frames));
        }
        self.write(&text);
    }

    /// Returns true if the object is now tracked and a finalize notification
    /// should be arranged for it.
    pub fn on_create(&self, id: ObjectId, type_name: &str) -> bool {
        if in_tracker() || !self.config.matches(type_name) {
            return false;
        }
        enter_tracker(|| {
            let mut state = self.state();
            if !state.registry.record_create(id) {
                return false;
            }
            let shown = self.config.shows(DisplayFlags::CREATE);
            let traced = self.config.shows(DisplayFlags::ORIGINS);
            let frames = self.frames(shown, traced);
            if shown {
                self.emit(format_args!(" ++ Created object {id}, {type_name}"), &frames);
            }
            if traced {
                state.origins.record(type_name, &frames, RefKind::Ref);
            }
            true
        })
    }

    pub fn on_ref(&self, id: ObjectId, type_name: &str, before: u32, after: u32) {
        self.on_ref_change(RefKind::Ref, id, type_name, before, after);
    }

    pub fn on_unref(&self, id: ObjectId, type_name: &str, before: u32, after: u32) {
        self.on_ref_change(RefKind::Unref, id, type_name, before, after);
    }

    fn on_ref_change(
        &self,
        kind: RefKind,
        id: ObjectId,
        type_name: &str,
        before: u32,
        after: u32,
    ) {
        if in_tracker() || !self.config.matches(type_name) {
            return;
        }
        let shown = self.config.shows(DisplayFlags::REFS);
        let traced = self.config.shows(DisplayFlags::ORIGINS);
        if !shown && !traced {
            return;
        }
        enter_tracker(|| {
            let mut state = self.state();
            let frames = self.frames(shown, traced);
            if shown {
                let prefix = match kind {
                    RefKind::Ref => " +  Reffed",
                    RefKind::Unref => " -  Unreffed",
                };
                self.emit(
                    format_args!("{prefix} object {id}, {type_name}; ref_count: {before} -> {after}"),
                    &frames,
                );
            }
            if traced {
                state.origins.record(type_name, &frames, kind);
            }
        })
    }

    /// Unknown identities are ignored. Origin tries are per type and stay.
    pub fn on_finalize(&self, id: ObjectId, type_name: &str) {
        if in_tracker() {
            return;
        }
        enter_tracker(|| {
            let mut state = self.state();
            if !state.registry.record_finalize(id, type_name) {
                return;
            }
            if self.config.shows(DisplayFlags::CREATE) {
                let frames = self.frames(true, false);
                self.emit(format_args!(" -- Finalized object {id}, {type_name}"), &frames);
            }
        })
    }

    fn object_list(&self, ids: Vec<ObjectId>) -> ObjectList {
        let total = ids.len();
        let entries = ids
            .into_iter()
            .filter_map(|id| {
                let info = self.inspector.inspect(id)?;
                // half-dead object, not worth reporting
                if info.ref_count == 0 {
                    return None;
                }
                Some(LiveEntry {
                    id,
                    type_name: info.type_name,
                    ref_count: info.ref_count,
                })
            })
            .collect();
        ObjectList { entries, total }
    }

    fn live_locked(&self, state: &State) -> LiveReport {
        LiveReport(self.object_list(state.registry.live()))
    }

    fn checkpoint_locked(&self, state: &mut State) -> CheckpointReport {
        let report = CheckpointReport {
            added: self.object_list(state.registry.added()),
            removed: state.registry.removed(),
        };
        state.registry.checkpoint_reset();
        if self.config.origin_eviction == OriginEviction::Checkpoint {
            state.origins.clear();
        }
        report
    }

    fn final_locked(&self, state: &State) -> FinalReport {
        FinalReport {
            alive: self.object_list(state.registry.live()),
            origins: self
                .config
                .shows(DisplayFlags::ORIGINS)
                .then(|| state.origins.snapshot()),
        }
    }

    pub fn live_report(&self) -> LiveReport {
        enter_tracker(|| self.live_locked(&self.state()))
    }

    /// Reports the delta since the previous checkpoint and starts a new one.
    pub fn checkpoint(&self) -> CheckpointReport {
        enter_tracker(|| self.checkpoint_locked(&mut self.state()))
    }

    pub fn final_report(&self) -> FinalReport {
        enter_tracker(|| self.final_locked(&self.state()))
    }

    pub fn dump_live(&self) {
        enter_tracker(|| {
            let state = self.state();
            self.write(&self.live_locked(&state).to_string());
        })
    }

    pub fn dump_checkpoint(&self) {
        enter_tracker(|| {
            let mut state = self.state();
            self.write(&self.checkpoint_locked(&mut state).to_string());
        })
    }

    /// Writes the final report unless it has already been written. Returns
    /// whether this call wrote it.
    pub fn dump_final(&self) -> bool {
        if self.final_reported.swap(true, Ordering::SeqCst) {
            return false;
        }
        enter_tracker(|| {
            let state = self.state();
            self.write(&self.final_locked(&state).to_string());
        });
        true
    }

    pub fn handle(&self, trigger: Trigger) {
        match trigger {
            Trigger::Live => self.dump_live(),
            Trigger::Checkpoint => self.dump_checkpoint(),
            Trigger::Final => {
                self.dump_final();
            }
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.state().registry.snapshot()
    }

    pub fn is_tracked(&self, id: ObjectId) -> bool {
        self.state().registry.contains(id)
    }

    pub fn origins(&self) -> Vec<OriginTrie> {
        self.state().origins.snapshot()
    }

    pub fn reset_origins(&self) {
        self.state().origins.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sink::MemorySink, stack::NoCapture, ObjectInfo};
    use std::{
        collections::HashMap,
        sync::{Arc, Barrier},
    };

    /// Hands out a fixed stack naming the thread it runs on.
    struct FixedCapture;

    impl StackCapture for FixedCapture {
        fn capture(&self) -> Vec<Frame> {
            let name = std::thread::current()
                .name()
                .unwrap_or("anon")
                .to_string();
            vec![
                Frame::new(format!("{name}_inner"), 0x4),
                Frame::new(format!("{name}_outer"), 0x8),
            ]
        }
    }

    #[derive(Clone, Default)]
    struct FakeObjects(Arc<Mutex<HashMap<ObjectId, ObjectInfo>>>);

    impl FakeObjects {
        fn set(&self, id: ObjectId, type_name: &str, ref_count: u32) {
            self.0.lock().unwrap().insert(
                id,
                ObjectInfo {
                    type_name: type_name.into(),
                    ref_count,
                },
            );
        }
    }

    impl ObjectInspector for FakeObjects {
        fn inspect(&self, id: ObjectId) -> Option<ObjectInfo> {
            self.0.lock().unwrap().get(&id).cloned()
        }
    }

    const A: ObjectId = ObjectId(0xa0);
    const B: ObjectId = ObjectId(0xb0);

    fn setup(config: Config) -> (Tracker, MemorySink, FakeObjects) {
        let sink = MemorySink::new();
        let objects = FakeObjects::default();
        let tracker = Tracker::builder(config)
            .capture(FixedCapture)
            .inspector(objects.clone())
            .sink(sink.clone())
            .build();
        (tracker, sink, objects)
    }

    #[test]
    fn create_emits_line() {
        let (tracker, sink, _) = setup(Config::default());
        assert!(tracker.on_create(A, "Foo"));
        assert_eq!(sink.take(), " ++ Created object 0xa0, Foo\n");
        assert!(!tracker.on_create(A, "Foo"));
        assert_eq!(sink.take(), "");
        assert_eq!(tracker.snapshot().live, vec![A]);
    }

    #[test]
    fn create_with_backtrace() {
        let config = Config::default().with_display(DisplayFlags::CREATE | DisplayFlags::BACKTRACE);
        let (tracker, sink, _) = setup(config);
        std::thread::Builder::new()
            .name("worker".into())
            .spawn(move || {
                tracker.on_create(A, "Foo");
            })
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(
            sink.take(),
            " ++ Created object 0xa0, Foo\n\
             #0  worker_inner + [0x00000004]\n\
             #1  worker_outer + [0x00000008]\n"
        );
    }

    #[test]
    fn ref_lines_need_refs_flag() {
        let (tracker, sink, _) = setup(Config::default());
        tracker.on_ref(A, "Foo", 1, 2);
        assert_eq!(sink.take(), "");

        let (tracker, sink, _) = setup(Config::default().with_display(DisplayFlags::REFS));
        tracker.on_ref(A, "Foo", 1, 2);
        tracker.on_unref(A, "Foo", 2, 1);
        assert_eq!(
            sink.take(),
            " +  Reffed object 0xa0, Foo; ref_count: 1 -> 2\n \
             -  Unreffed object 0xa0, Foo; ref_count: 2 -> 1\n"
        );
        // refs never change liveness
        assert!(tracker.snapshot().live.is_empty());
    }

    #[test]
    fn finalize_emits_and_unregisters() {
        let (tracker, sink, _) = setup(Config::default());
        tracker.on_create(A, "Foo");
        tracker.on_finalize(A, "Foo");
        tracker.on_finalize(B, "Foo");
        assert_eq!(
            sink.take(),
            " ++ Created object 0xa0, Foo\n -- Finalized object 0xa0, Foo\n"
        );
        assert!(!tracker.is_tracked(A));
    }

    #[test]
    fn filter_excludes_other_types() {
        let config = Config::default()
            .with_display(DisplayFlags::ALL)
            .with_filter("Widget");
        let (tracker, sink, _) = setup(config);
        assert!(!tracker.on_create(A, "Gadget"));
        tracker.on_ref(A, "Gadget", 1, 2);
        tracker.on_unref(A, "Gadget", 2, 1);
        tracker.checkpoint();
        tracker.on_finalize(A, "Gadget");
        assert_eq!(sink.take(), "");
        assert_eq!(tracker.snapshot(), RegistrySnapshot::default());
        assert!(tracker.origins().is_empty());

        assert!(tracker.on_create(B, "Widget"));
        assert!(sink.take().contains("Widget"));
    }

    #[test]
    fn checkpoint_scenario() {
        let (tracker, sink, objects) = setup(Config::default().with_display(DisplayFlags::NONE));
        objects.set(A, "Foo", 1);
        tracker.on_create(A, "Foo");
        assert_eq!(tracker.snapshot().live, vec![A]);

        tracker.dump_checkpoint();
        assert_eq!(
            sink.take(),
            "Added Objects:\n - 0xa0, Foo: 1 refs\n1 objects\n\
             \nRemoved Objects:\n0 objects\n\
             \nSaved new check point\n"
        );
        let snapshot = tracker.snapshot();
        assert!(snapshot.added.is_empty() && snapshot.removed.is_empty());

        tracker.on_unref(A, "Foo", 1, 0);
        tracker.on_finalize(A, "Foo");
        objects.0.lock().unwrap().remove(&A);
        assert!(tracker.snapshot().live.is_empty());

        let report = tracker.checkpoint();
        assert!(report.added.entries.is_empty());
        assert_eq!(report.removed, vec![(A, "Foo".to_string())]);
        assert_eq!(tracker.snapshot(), RegistrySnapshot::default());
    }

    #[test]
    fn checkpoint_reset_twice() {
        let (tracker, _, _) = setup(Config::default().with_display(DisplayFlags::NONE));
        tracker.on_create(A, "Foo");
        tracker.checkpoint();
        assert_eq!(tracker.checkpoint(), CheckpointReport::default());
        assert_eq!(tracker.checkpoint(), CheckpointReport::default());
    }

    #[test]
    fn live_dump_skips_unreadable_entries() {
        let (tracker, sink, objects) = setup(Config::default().with_display(DisplayFlags::NONE));
        objects.set(A, "Foo", 3);
        objects.set(B, "Bar", 0);
        tracker.on_create(A, "Foo");
        tracker.on_create(B, "Bar");
        tracker.on_create(ObjectId(0xc0), "Baz");
        tracker.handle(Trigger::Live);
        assert_eq!(sink.take(), "Living Objects:\n - 0xa0, Foo: 3 refs\n3 objects\n");
    }

    #[test]
    fn origins_survive_finalize() {
        let config = Config::default().with_display(DisplayFlags::ORIGINS);
        let (tracker, sink, _) = setup(config);
        tracker.on_create(A, "Foo");
        tracker.on_ref(A, "Foo", 1, 2);
        tracker.on_unref(A, "Foo", 2, 1);
        tracker.on_finalize(A, "Foo");
        assert_eq!(sink.take(), "");

        let origins = tracker.origins();
        assert_eq!(origins.len(), 1);
        assert_eq!(origins[0].total(RefKind::Ref), 2);
        assert_eq!(origins[0].total(RefKind::Unref), 1);

        let report = tracker.final_report();
        assert!(report.alive.entries.is_empty());
        assert_eq!(report.origins.map(|x| x.len()), Some(1));

        tracker.reset_origins();
        assert!(tracker.origins().is_empty());
    }

    #[test]
    fn origins_evicted_on_checkpoint_when_asked() {
        let config = Config::default()
            .with_display(DisplayFlags::ORIGINS)
            .with_origin_eviction(OriginEviction::Checkpoint);
        let (tracker, _, _) = setup(config);
        tracker.on_ref(A, "Foo", 1, 2);
        assert_eq!(tracker.origins().len(), 1);
        tracker.checkpoint();
        assert!(tracker.origins().is_empty());
    }

    #[test]
    fn final_dump_happens_once() {
        let (tracker, sink, objects) = setup(Config::default().with_display(DisplayFlags::NONE));
        objects.set(A, "Foo", 2);
        tracker.on_create(A, "Foo");
        assert!(tracker.dump_final());
        assert!(!tracker.dump_final());
        tracker.handle(Trigger::Final);
        assert_eq!(sink.take(), "\nStill Alive:\n - 0xa0, Foo: 2 refs\n1 objects\n");
    }

    #[test]
    fn unavailable_capture_warns_once() {
        let sink = MemorySink::new();
        let tracker = Tracker::builder(Config::default().with_display(DisplayFlags::ALL))
            .capture(NoCapture)
            .sink(sink.clone())
            .build();
        let warnings = sink.take();
        assert_eq!(warnings.lines().count(), 2);
        assert!(!tracker.config().shows(DisplayFlags::BACKTRACE));
        tracker.on_ref(A, "Foo", 1, 2);
        assert_eq!(sink.take(), " +  Reffed object 0xa0, Foo; ref_count: 1 -> 2\n");
        assert!(tracker.origins().is_empty());
    }

    #[test]
    fn concurrent_output_is_not_interleaved() {
        const THREADS: usize = 8;
        const EVENTS: usize = 200;
        let config = Config::default().with_display(DisplayFlags::REFS | DisplayFlags::BACKTRACE);
        let (tracker, sink, _) = setup(config);
        let tracker = Arc::new(tracker);
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let tracker = tracker.clone();
                let barrier = barrier.clone();
                std::thread::Builder::new()
                    .name(format!("t{i}"))
                    .spawn(move || {
                        barrier.wait();
                        for _ in 0..EVENTS {
                            tracker.on_ref(ObjectId(i), &format!("t{i}"), 1, 2);
                        }
                    })
                    .unwrap()
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let output = sink.take();
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines.len(), THREADS * EVENTS * 3);
        for chunk in lines.chunks(3) {
            let owner = chunk[0].rsplit_once(", ").unwrap().1.split(';').next().unwrap();
            assert!(chunk[1].contains(&format!("{owner}_inner")), "{chunk:?}");
            assert!(chunk[2].contains(&format!("{owner}_outer")), "{chunk:?}");
        }
    }

    #[test]
    fn concurrent_create_finalize_and_checkpoint() {
        const THREADS: usize = 4;
        const OBJECTS: usize = 500;
        let (tracker, _, _) = setup(Config::default().with_display(DisplayFlags::NONE));
        let tracker = Arc::new(tracker);
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for i in 0..OBJECTS {
                        let id = ObjectId(t * OBJECTS + i + 1);
                        tracker.on_create(id, "Foo");
                        if i % 2 == 0 {
                            tracker.on_finalize(id, "Foo");
                        }
                        if i % 50 == 0 {
                            tracker.checkpoint();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.live.len(), THREADS * OBJECTS / 2);
        assert!(snapshot.live.iter().all(|id| (id.0 - 1) % OBJECTS % 2 == 1));
        // every added object is still alive
        assert!(snapshot.added.iter().all(|id| snapshot.live.contains(id)));
    }
}
