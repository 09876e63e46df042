//! Detection workers: field discovery and state merge off the main context.
//!
//! A [`DetectionWorker`] is a small pool of threads sharing one job queue.
//! Each job is turned into a detected [`State`] by [`detect`], a pure
//! function of the job's snapshots, and the result is posted back to the
//! main context as a [`MainTask::Detected`]. The main context then links the
//! state into its page store; nothing here touches a live store.

use super::messages::{DetectionJob, MainTask};
use crate::domain::{CanopyError, Result};
use crate::state::{RootLink, State};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::thread::{self, JoinHandle};

/// Detects the fields of a job's state and merges the parent projection and
/// global bindings into it.
///
/// The returned state carries the job's token. Aliased props hold the value
/// their root had in the snapshot; the main context refreshes them when it
/// links the state.
///
/// # Errors
///
/// - [`CanopyError::Detection`] for an invalid declaration or a cancelled job
/// - [`CanopyError::UnknownProp`] for a binding naming a missing prop
/// - any error returned by the connector's projection
pub fn detect(job: &DetectionJob) -> Result<State> {
    let _span = tracing::debug_span!("detect", component = %job.name, token = %job.token).entered();
    check_cancelled(job)?;

    let mut state = State::with_token(job.token, job.name.clone(), job.kind);
    state.detect_fields(&job.decl)?;

    if let Some(parent) = &job.parent {
        let mut binder = crate::component::ProjectionBinder::default();
        for (child_key, parent_key) in &job.parent_bindings {
            binder.bind(child_key.clone(), parent_key.clone());
        }
        if let Some(projection) = &job.projection {
            projection(parent, &mut binder)?;
        }

        if !binder.values().is_empty() {
            state.begin_recording();
            let assigned = binder
                .values()
                .iter()
                .try_for_each(|(key, value)| state.set_value(key, value.clone()));
            if let Err(err) = assigned {
                state.discard_recording();
                return Err(err);
            }
            state.end_recording();
        }

        for (child_key, parent_key) in binder.aliases() {
            let prop = parent.prop(parent_key).ok_or_else(|| CanopyError::UnknownProp {
                key: parent_key.clone(),
                state: parent.name().to_string(),
            })?;
            let link = match prop.root() {
                Some(root) => root,
                None => parent
                    .prop_ref(parent_key)
                    .map(RootLink::upper)
                    .ok_or_else(|| CanopyError::UnknownProp {
                        key: parent_key.clone(),
                        state: parent.name().to_string(),
                    })?,
            };
            state.depend_on(child_key, link, prop.value().clone())?;
        }
    }

    for global in &job.globals {
        let root = global
            .state
            .prop_ref(&global.global_key)
            .ok_or_else(|| CanopyError::UnknownProp {
                key: global.global_key.clone(),
                state: global.state.name().to_string(),
            })?;
        let value = global
            .state
            .value(&global.global_key)
            .cloned()
            .unwrap_or_default();
        state.depend_on(&global.child_key, RootLink::global(global.store, root), value)?;
    }

    check_cancelled(job)?;
    tracing::debug!(props = state.len(), links = state.root_links().len(), "state detected");
    Ok(state)
}

fn check_cancelled(job: &DetectionJob) -> Result<()> {
    if job.is_cancelled() {
        return Err(CanopyError::Detection(format!(
            "detection of `{}` was cancelled",
            job.name
        )));
    }
    Ok(())
}

/// Attaches the scheduling span's context to the worker thread, so spans
/// created while the job runs join the same trace.
///
/// Returns a guard that must be held for the duration of the job.
fn attach_parent_trace_context(job: &DetectionJob) -> Option<opentelemetry::ContextGuard> {
    use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};

    let trace_context = job.trace_context.as_ref()?;
    let trace_id = TraceId::from_hex(&trace_context.trace_id).ok()?;
    let span_id = SpanId::from_hex(&trace_context.parent_span_id).ok()?;

    let span_context = SpanContext::new(
        trace_id,
        span_id,
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    );
    let otel_context = opentelemetry::Context::current().with_remote_span_context(span_context);
    Some(otel_context.attach())
}

/// Pool of detection threads.
#[derive(Debug)]
pub struct DetectionWorker {
    jobs: Option<Sender<DetectionJob>>,
    handles: Vec<JoinHandle<()>>,
}

impl DetectionWorker {
    /// Spawns `threads` workers (at least one) posting results to `results`.
    ///
    /// # Errors
    ///
    /// Returns [`CanopyError::Io`] if a thread cannot be spawned.
    pub fn spawn(threads: usize, results: &Sender<MainTask>) -> Result<Self> {
        let (jobs, queue) = unbounded::<DetectionJob>();
        let count = threads.max(1);
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let queue = queue.clone();
            let results = results.clone();
            let handle = thread::Builder::new()
                .name(format!("canopy-detect-{index}"))
                .spawn(move || run(&queue, &results))
                .map_err(CanopyError::Io)?;
            handles.push(handle);
        }
        tracing::debug!(threads = count, "detection workers spawned");
        Ok(Self {
            jobs: Some(jobs),
            handles,
        })
    }

    /// Returns a sender for scheduling jobs.
    #[must_use]
    pub fn sender(&self) -> Option<Sender<DetectionJob>> {
        self.jobs.clone()
    }

    /// Returns the number of worker threads.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Closes the queue and joins the workers once every sender is gone.
    pub fn shutdown(&mut self) {
        self.jobs = None;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("detection worker panicked");
            }
        }
    }
}

impl Drop for DetectionWorker {
    fn drop(&mut self) {
        self.jobs = None;
    }
}

fn run(queue: &Receiver<DetectionJob>, results: &Sender<MainTask>) {
    while let Ok(job) = queue.recv() {
        let _context_guard = attach_parent_trace_context(&job);
        let span = tracing::debug_span!(
            "detection_job",
            component = %job.name,
            page = %job.page,
            node = %job.node,
            traced = job.trace_context.is_some()
        );
        let _guard = span.entered();

        if job.is_cancelled() {
            tracing::debug!("job cancelled before start, dropped");
            continue;
        }
        let outcome = detect(&job);
        if let Err(err) = &outcome {
            tracing::debug!(error = %err, "detection failed");
        }
        let task = MainTask::Detected {
            page: job.page,
            node: job.node,
            outcome,
        };
        if results.send(task).is_err() {
            tracing::debug!("main context gone, worker exiting");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{NodeId, PageId};
    use crate::state::{PropIndex, PropOrigin, StateDecl, StateKind, StateToken};
    use crate::worker::messages::GlobalSnapshot;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    fn parent() -> State {
        let mut parent = State::new("page", StateKind::Page);
        parent
            .detect_fields(&StateDecl::new().field("count", 4).field("title", "hi"))
            .unwrap();
        parent
    }

    fn job(parent: Option<State>) -> DetectionJob {
        DetectionJob {
            page: PageId::next(),
            node: NodeId(1),
            token: StateToken::next(),
            name: "child".to_string(),
            kind: StateKind::Component,
            decl: StateDecl::new().field("count", 0).field("caption", ""),
            parent,
            parent_bindings: vec![("count".to_string(), "count".to_string())],
            projection: Some(Arc::new(
                |parent: &State, binder: &mut crate::component::ProjectionBinder| -> Result<()> {
                    let title: String = parent.get("title")?;
                    binder.assign("caption", format!("{title}!"));
                    Ok(())
                },
            )),
            globals: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            trace_context: None,
        }
    }

    #[test]
    fn detect_merges_parent_projection() {
        let parent = parent();
        let parent_token = parent.token();
        let job = job(Some(parent));

        let state = detect(&job).unwrap();

        assert_eq!(state.token(), job.token);
        assert_eq!(state.get::<i64>("count").unwrap(), 4);
        assert_eq!(state.get::<String>("caption").unwrap(), "hi!");
        let link = state.prop("count").unwrap().root().unwrap();
        assert_eq!(link.prop.token, parent_token);
        assert_eq!(link.origin, PropOrigin::Upper);
        assert!(!state.is_recording());
    }

    #[test]
    fn detect_binds_globals_and_rejects_missing_keys() {
        let mut global = State::new("session", StateKind::Global);
        global.detect_fields(&StateDecl::new().field("user", "ada")).unwrap();
        let store = crate::store::StoreId::next();

        let mut ok = job(None);
        ok.globals.push(GlobalSnapshot {
            store,
            child_key: "caption".to_string(),
            global_key: "user".to_string(),
            state: global.copy(),
        });
        let state = detect(&ok).unwrap();
        assert_eq!(state.get::<String>("caption").unwrap(), "ada");
        assert!(state.prop("caption").unwrap().is_bound_to_global());
        assert_eq!(state.prop("caption").unwrap().root().unwrap().prop.index, PropIndex(0));

        let mut missing = job(None);
        missing.globals.push(GlobalSnapshot {
            store,
            child_key: "caption".to_string(),
            global_key: "nope".to_string(),
            state: global,
        });
        assert!(matches!(detect(&missing), Err(CanopyError::UnknownProp { .. })));
    }

    #[test]
    fn cancelled_jobs_fail_detection() {
        let job = job(Some(parent()));
        job.cancel.store(true, std::sync::atomic::Ordering::Release);
        assert!(matches!(detect(&job), Err(CanopyError::Detection(_))));
    }

    #[test]
    fn worker_posts_results_back() {
        let (tx, rx) = unbounded();
        let mut worker = DetectionWorker::spawn(2, &tx).unwrap();
        let job = job(Some(parent()));
        let token = job.token;
        worker.sender().unwrap().send(job).unwrap();

        let task = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        match task {
            MainTask::Detected { outcome, .. } => assert_eq!(outcome.unwrap().token(), token),
            MainTask::Tick(_) => panic!("unexpected tick"),
        }
        assert_eq!(worker.threads(), 2);
        worker.shutdown();
    }
}
