//! Demo binary: a counter page driven through its full lifecycle.
//!
//! ```text
//! canopy [config.toml]
//! ```
//!
//! The page holds a `counter` root and a `badge` child. The root binds the
//! `theme` global's `accent` prop, and the badge aliases the root's `count`
//! and `accent` props, so every increment and theme change shows up in the
//! badge's batches without the badge running a reducer of its own.
//!
//! # Flow
//!
//! 1. Load configuration and install the tracing subscriber
//! 2. Create the runtime and the page, bind a lifecycle emitter
//! 3. Emit `Create`, `Start`, `Resume`; wait for the badge to detect its state
//! 4. Tap three times, then switch the theme accent
//! 5. Emit `Pause`, `Stop`, `Destroy` and shut the runtime down

#![allow(clippy::multiple_crate_versions)]

use canopy::component::{
    Component, ComponentContext, Connector, Dependant, DependantCollector, LifecycleEmitter,
    LifecycleEvent, Page,
};
use canopy::effect::EffectCollector;
use canopy::observability::init_tracing;
use canopy::reducer::{ReducerCollector, Reduction};
use canopy::state::{State, StateDecl};
use canopy::{Action, Config, GlobalStore, Payload, Result, Runtime};
use std::process::ExitCode;
use std::time::Duration;

const FRAME_WAIT: Duration = Duration::from_millis(40);

fn increment() -> Action {
    Action::private("increment")
}

fn tap() -> Action {
    Action::private("tap")
}

struct Counter;

impl Component for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn state(&self) -> StateDecl {
        StateDecl::new()
            .field("count", 0)
            .field("label", "taps")
            .field("accent", "")
    }

    fn reducers(&self, reducers: &mut ReducerCollector) {
        reducers.on(&increment(), |state, payload: &Payload| {
            let count: i64 = state.get("count")?;
            state.set("count", count + payload.as_i64().unwrap_or(1))?;
            Ok(Reduction::Updated)
        });
    }

    fn effects(&self, effects: &mut EffectCollector) {
        effects.on(&tap(), |_, ctx: &ComponentContext, _| {
            ctx.dispatch_reducer(&increment(), &Payload::from(1))
        });
    }

    fn dependencies(&self, dependants: &mut DependantCollector) {
        let connector = Connector::new()
            .bind_parent("count", "count")
            .bind_parent("accent", "accent")
            .project(|parent, binder| {
                let label: String = parent.get("label")?;
                binder.assign("caption", format!("{label}:"));
                Ok(())
            });
        dependants.add(
            "badge",
            Dependant::new(Badge, connector).with_applier(|state: &State, keys: &[String]| {
                print_batch("badge", state, keys);
            }),
        );
    }
}

struct Badge;

impl Component for Badge {
    fn name(&self) -> &str {
        "badge"
    }

    fn state(&self) -> StateDecl {
        StateDecl::new()
            .field("count", 0)
            .field("accent", "")
            .field("caption", "")
    }
}

fn print_batch(component: &str, state: &State, keys: &[String]) {
    let rendered: Vec<String> = keys
        .iter()
        .map(|key| {
            let value = state.value(key).map(ToString::to_string).unwrap_or_default();
            format!("{key}={value}")
        })
        .collect();
    println!("[{component}] {}", rendered.join(" "));
}

fn load_config() -> Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    }
}

fn run(config: Config) -> Result<()> {
    let theme = GlobalStore::new("theme", &StateDecl::new().field("accent", "green"))?;
    let runtime = Runtime::new(config)?;

    let root = Dependant::new(Counter, Connector::new().bind_global(&theme, "accent", "accent"))
        .with_applier(|state: &State, keys: &[String]| print_batch("counter", state, keys));
    let page = Page::new(&runtime, "counter", root)?;

    let lifecycle = LifecycleEmitter::new();
    page.bind_lifecycle(&lifecycle);
    for event in [LifecycleEvent::Create, LifecycleEvent::Start, LifecycleEvent::Resume] {
        lifecycle.emit(event);
    }

    let ready = runtime.run_until(Duration::from_secs(2), || {
        page.find(&["badge"]).is_some_and(|badge| badge.is_ready())
    });
    if !ready {
        tracing::warn!("badge did not become ready in time");
    }

    let counter = page
        .root()
        .and_then(|root| root.context())
        .ok_or_else(|| canopy::CanopyError::Detection("counter root is gone".to_string()))?;
    for _ in 0..3 {
        let report = counter.dispatch_effect(&tap(), &Payload::Null)?;
        for failure in &report.failures {
            tracing::warn!(error = %failure, "tap failed");
        }
        runtime.pump_for(FRAME_WAIT);
        if !runtime.config().frame_ticker {
            page.tick();
        }
    }

    theme.update_state("accent", |state| {
        state.set("accent", "blue")?;
        Ok(Reduction::Updated)
    })?;
    runtime.pump_for(FRAME_WAIT);
    if !runtime.config().frame_ticker {
        page.tick();
    }

    let count: i64 = counter.get("count")?;
    tracing::info!(count, "demo finished");

    for event in [LifecycleEvent::Pause, LifecycleEvent::Stop, LifecycleEvent::Destroy] {
        lifecycle.emit(event);
    }
    runtime.shutdown();
    Ok(())
}

fn main() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("canopy: {err}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config);

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "demo failed");
            eprintln!("canopy: {err}");
            ExitCode::FAILURE
        }
    }
}
