//! Frame-aligned batching of component state changes.

use canopy::component::{
    Component, Connector, Dependant, DependantCollector, InstallState, LifecycleEvent, Page,
};
use canopy::reducer::{ReducerCollector, Reduction};
use canopy::state::{State, StateDecl};
use canopy::{Action, Config, Runtime};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

type Batches = Rc<RefCell<Vec<(i64, Vec<String>)>>>;

fn increment() -> Action {
    Action::private("increment")
}

struct Counter {
    children: Vec<&'static str>,
}

impl Component for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn state(&self) -> StateDecl {
        StateDecl::new().field("count", 0).field("label", "taps")
    }

    fn reducers(&self, reducers: &mut ReducerCollector) {
        reducers.on(&increment(), |state, payload| {
            let count: i64 = state.get("count")?;
            state.set("count", count + payload.as_i64().unwrap_or(1))?;
            Ok(Reduction::Updated)
        });
    }

    fn dependencies(&self, dependants: &mut DependantCollector) {
        for key in &self.children {
            dependants.add(
                *key,
                Dependant::new(Badge, Connector::new().bind_parent("count", "count")),
            );
        }
    }
}

struct Badge;

impl Component for Badge {
    fn name(&self) -> &str {
        "badge"
    }

    fn state(&self) -> StateDecl {
        StateDecl::new().field("count", 0)
    }
}

fn recording_root(children: Vec<&'static str>) -> (Dependant, Batches) {
    let batches: Batches = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&batches);
    let root = Dependant::new(Counter { children }, Connector::new()).with_applier(
        move |state: &State, keys: &[String]| {
            let count = state.get::<i64>("count").unwrap_or_default();
            sink.borrow_mut().push((count, keys.to_vec()));
        },
    );
    (root, batches)
}

fn runtime(min_frame_spacing: Duration, async_install: bool) -> Runtime {
    Runtime::new(Config {
        frame_ticker: false,
        min_frame_spacing,
        async_install,
        ..Config::default()
    })
    .unwrap()
}

fn show(page: &Page) {
    for event in [LifecycleEvent::Create, LifecycleEvent::Start, LifecycleEvent::Resume] {
        page.on_lifecycle(event);
    }
}

fn increment_root(page: &Page, by: i64) {
    page.root()
        .and_then(|root| root.context())
        .unwrap()
        .dispatch_reducer(&increment(), &json!(by))
        .unwrap();
}

#[test]
fn first_show_delivers_initial_values_then_increments_batch_by_key() {
    let runtime = runtime(Duration::ZERO, false);
    let (root, batches) = recording_root(Vec::new());
    let page = Page::new(&runtime, "counter", root).unwrap();
    show(&page);

    assert!(page.tick());
    increment_root(&page, 1);
    increment_root(&page, 1);
    assert!(page.tick());

    assert_eq!(
        *batches.borrow(),
        vec![
            (0, vec!["count".to_string(), "label".to_string()]),
            (2, vec!["count".to_string()]),
        ]
    );
}

#[test]
fn ticks_inside_the_spacing_window_defer_to_one_merged_batch() {
    let runtime = runtime(Duration::from_millis(50), false);
    let (root, batches) = recording_root(Vec::new());
    let page = Page::new(&runtime, "counter", root).unwrap();
    show(&page);

    let start = Instant::now();
    assert!(page.store().on_tick_at(start));

    increment_root(&page, 5);
    assert!(!page.store().on_tick_at(start + Duration::from_millis(10)));
    page.root()
        .and_then(|root| root.context())
        .unwrap()
        .update_state("rename", |state| {
            state.set("label", "clicks")?;
            Ok(Reduction::Updated)
        })
        .unwrap();
    assert!(page.store().on_tick_at(start + Duration::from_millis(60)));

    let batches = batches.borrow();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1], (5, vec!["count".to_string(), "label".to_string()]));
}

#[test]
fn hidden_pages_do_not_fire_and_nothing_pending_does_not_fire() {
    let runtime = runtime(Duration::ZERO, false);
    let (root, batches) = recording_root(Vec::new());
    let page = Page::new(&runtime, "counter", root).unwrap();
    page.on_lifecycle(LifecycleEvent::Create);

    increment_root(&page, 1);
    assert!(!page.tick());

    page.on_lifecycle(LifecycleEvent::Resume);
    assert!(page.tick());
    assert!(!page.tick());
    assert_eq!(batches.borrow().len(), 1);
}

#[test]
fn hide_is_idempotent_and_a_reshow_refreshes_every_key() {
    let runtime = runtime(Duration::ZERO, false);
    let (root, batches) = recording_root(Vec::new());
    let page = Page::new(&runtime, "counter", root).unwrap();
    show(&page);
    assert!(page.tick());

    let handle = page.root().unwrap();
    handle.hide();
    handle.hide();
    increment_root(&page, 1);
    page.tick();
    assert_eq!(batches.borrow().len(), 1);

    handle.show();
    assert!(page.tick());
    assert_eq!(
        batches.borrow().last().cloned(),
        Some((1, vec!["count".to_string(), "label".to_string()]))
    );
}

#[test]
fn async_children_queue_lifecycle_until_detection_lands() {
    let runtime = runtime(Duration::ZERO, true);
    let (root, _) = recording_root(vec!["badge"]);
    let page = Page::new(&runtime, "counter", root).unwrap();
    show(&page);

    let badge = page.find(&["badge"]).unwrap();
    assert_eq!(badge.install_state(), InstallState::StateDetecting);
    assert_eq!(badge.pending_ops(), 3);

    assert!(runtime.run_until(Duration::from_secs(5), || badge.is_ready()));
    assert_eq!(badge.pending_ops(), 0);
    assert!(badge.install_state().is_showing());

    increment_root(&page, 4);
    assert_eq!(badge.state().unwrap().get::<i64>("count").unwrap(), 4);
}

#[test]
fn failed_detection_stays_detecting_and_never_flushes() {
    let runtime = runtime(Duration::ZERO, true);
    let (root, _) = recording_root(Vec::new());
    let page = Page::new(&runtime, "counter", root).unwrap();
    show(&page);

    let parent = page.root().unwrap();
    let broken = Connector::new().bind_parent("count", "missing");
    let badge = page
        .install_dependant(&parent, "broken", Dependant::new(Badge, broken))
        .unwrap();
    assert_eq!(badge.install_state(), InstallState::StateDetecting);
    assert_eq!(badge.pending_ops(), 3);

    assert!(runtime.run_until(Duration::from_secs(5), || badge.detection_error().is_some()));
    assert!(badge.detection_error().unwrap().contains("missing"));
    assert_eq!(badge.install_state(), InstallState::StateDetecting);
    assert!(!badge.is_ready());
    assert!(badge.state().is_none());
    assert_eq!(badge.pending_ops(), 3);

    page.on_lifecycle(LifecycleEvent::Pause);
    parent.context().unwrap().dispatch_to_children(&increment(), &json!(1)).unwrap();
    runtime.pump_for(Duration::from_millis(20));
    assert_eq!(badge.install_state(), InstallState::StateDetecting);
    assert_eq!(badge.pending_ops(), 3);
    assert_eq!(page.all_states().len(), 1);
}

#[test]
fn destroying_a_detecting_child_discards_its_result() {
    let runtime = runtime(Duration::ZERO, true);
    let (root, _) = recording_root(vec!["badge"]);
    let page = Page::new(&runtime, "counter", root).unwrap();
    page.on_lifecycle(LifecycleEvent::Create);

    let badge = page.find(&["badge"]).unwrap();
    badge.destroy();
    runtime.pump_for(Duration::from_millis(100));

    assert_eq!(badge.install_state(), InstallState::Destroyed);
    assert!(page.find(&["badge"]).is_none());
    assert_eq!(page.all_states().len(), 1);
}

#[test]
fn extra_dependants_install_once_per_key() {
    let runtime = runtime(Duration::ZERO, false);
    let (root, _) = recording_root(Vec::new());
    let page = Page::new(&runtime, "counter", root).unwrap();
    show(&page);

    let parent = page.root().unwrap();
    let first = page
        .install_dependant(&parent, "extra", Dependant::new(Badge, Connector::new()))
        .unwrap();
    let again = page
        .install_dependant(&parent, "extra", Dependant::new(Badge, Connector::new()))
        .unwrap();

    assert_eq!(first.token(), again.token());
    assert_eq!(page.component_count(), 2);
    assert!(first.install_state().is_showing());
}
