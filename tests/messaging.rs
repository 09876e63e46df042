//! Effects, interception, bus routing and global bindings across a page.

use canopy::component::{
    Component, ComponentContext, Connector, Dependant, DependantCollector, LifecycleEvent, Page,
};
use canopy::effect::{EffectCollector, InterceptorCollector};
use canopy::reducer::{ReducerCollector, Reduction};
use canopy::state::{StateDecl, StateToken};
use canopy::store::{Middleware, Next};
use canopy::{Action, CanopyError, Config, GlobalStore, Payload, Runtime};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;

type Log = Rc<RefCell<Vec<String>>>;

fn ping() -> Action {
    Action::public("ping")
}

fn hello() -> Action {
    Action::private("hello")
}

struct Hub {
    log: Log,
    theme: Rc<GlobalStore>,
}

impl Component for Hub {
    fn name(&self) -> &str {
        "hub"
    }

    fn state(&self) -> StateDecl {
        StateDecl::new().field("count", 0)
    }

    fn reducers(&self, reducers: &mut ReducerCollector) {
        reducers.on(&Action::private("bump"), |state, _| {
            let count: i64 = state.get("count")?;
            state.set("count", count + 1)?;
            Ok(Reduction::Updated)
        });
    }

    fn effects(&self, effects: &mut EffectCollector) {
        let log = Rc::clone(&self.log);
        effects.on(&hello(), move |_, ctx: &ComponentContext, _| {
            log.borrow_mut().push(format!("hello:{}", ctx.name()));
            Ok(())
        });
    }

    fn dependencies(&self, dependants: &mut DependantCollector) {
        for label in ["left", "right"] {
            let log = Rc::clone(&self.log);
            let connector = Connector::new()
                .bind_global(&self.theme, "accent", "accent")
                .intercept(&ping(), move |_, ctx: &ComponentContext, _| {
                    log.borrow_mut().push(format!("intercept:{}", ctx.name()));
                    Ok(())
                })
                .unwrap();
            dependants.add(
                label,
                Dependant::new(
                    Peer {
                        label,
                        log: Rc::clone(&self.log),
                    },
                    connector,
                ),
            );
        }
    }
}

struct Peer {
    label: &'static str,
    log: Log,
}

impl Component for Peer {
    fn name(&self) -> &str {
        self.label
    }

    fn state(&self) -> StateDecl {
        StateDecl::new().field("accent", "")
    }

    fn effects(&self, effects: &mut EffectCollector) {
        let log = Rc::clone(&self.log);
        effects.on(&ping(), move |_, ctx: &ComponentContext, _| {
            log.borrow_mut().push(format!("effect:{}", ctx.name()));
            Ok(())
        });
        let log = Rc::clone(&self.log);
        effects.on(&hello(), move |_, ctx: &ComponentContext, _| {
            log.borrow_mut().push(format!("hello:{}", ctx.name()));
            Ok(())
        });
    }
}

struct Shell {
    log: Log,
}

impl Component for Shell {
    fn name(&self) -> &str {
        "shell"
    }

    fn state(&self) -> StateDecl {
        StateDecl::new().field("accent", "")
    }

    fn dependencies(&self, dependants: &mut DependantCollector) {
        dependants.add(
            "inner",
            Dependant::new(
                Peer {
                    label: "inner",
                    log: Rc::clone(&self.log),
                },
                Connector::new().bind_parent("accent", "accent"),
            ),
        );
    }
}

struct Fixture {
    runtime: Runtime,
    theme: Rc<GlobalStore>,
    log: Log,
}

impl Fixture {
    fn new() -> Self {
        let runtime = Runtime::new(Config {
            frame_ticker: false,
            async_install: false,
            ..Config::default()
        })
        .unwrap();
        let theme = GlobalStore::new("theme", &StateDecl::new().field("accent", "green")).unwrap();
        Self {
            runtime,
            theme,
            log: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn page(&self, name: &str) -> Page {
        let hub = Hub {
            log: Rc::clone(&self.log),
            theme: Rc::clone(&self.theme),
        };
        let page = Page::new(&self.runtime, name, Dependant::new(hub, Connector::new())).unwrap();
        page.on_lifecycle(LifecycleEvent::Create);
        page
    }

    fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.borrow_mut())
    }
}

fn ctx(page: &Page, path: &[&str]) -> ComponentContext {
    page.find(path).and_then(|handle| handle.context()).unwrap()
}

#[test]
fn interception_runs_every_interceptor_but_the_senders() {
    let fixture = Fixture::new();
    let page = fixture.page("main");

    let report = ctx(&page, &["left"]).dispatch_effect(&ping(), &Payload::Null).unwrap();

    assert_eq!(report.handled, 2);
    assert_eq!(fixture.take_log(), vec!["effect:left", "intercept:right"]);
}

#[test]
fn page_interceptors_also_see_public_effects_of_the_root() {
    let fixture = Fixture::new();
    let page = fixture.page("main");
    let log = Rc::clone(&fixture.log);
    let mut collector = InterceptorCollector::new();
    collector
        .on(&ping(), move |_, ctx: &ComponentContext, _| {
            log.borrow_mut().push(format!("page:{}", ctx.name()));
            Ok(())
        })
        .unwrap();
    page.intercept(collector).unwrap();

    let report = ctx(&page, &[]).dispatch_effect(&ping(), &Payload::Null).unwrap();
    assert_eq!(report.handled, 3);
    assert_eq!(fixture.take_log(), vec!["intercept:left", "intercept:right", "page:hub"]);

    ctx(&page, &["left"]).dispatch_effect(&ping(), &Payload::Null).unwrap();
    assert_eq!(fixture.take_log(), vec!["effect:left", "intercept:right", "page:hub"]);
}

#[test]
fn private_actions_never_leave_the_family() {
    let fixture = Fixture::new();
    let page = fixture.page("main");
    let left = ctx(&page, &["left"]);

    assert!(matches!(
        left.dispatch_to_interceptor(&hello(), &Payload::Null),
        Err(CanopyError::ActionScope(_))
    ));
    assert!(matches!(left.broadcast(&hello(), &Payload::Null), Err(CanopyError::ActionScope(_))));
    assert!(matches!(
        left.dispatch_to_page(&hello(), &Payload::Null),
        Err(CanopyError::ActionScope(_))
    ));

    left.dispatch_to_parent(&hello(), &Payload::Null).unwrap();
    assert_eq!(fixture.take_log(), vec!["hello:hub"]);

    ctx(&page, &[]).dispatch_to_children(&hello(), &Payload::Null).unwrap();
    assert_eq!(fixture.take_log(), vec!["hello:left", "hello:right"]);
}

#[test]
fn page_dispatch_skips_the_sender_and_broadcast_reaches_every_page() {
    let fixture = Fixture::new();
    let main = fixture.page("main");
    let _other = fixture.page("other");

    ctx(&main, &["left"]).dispatch_to_page(&ping(), &json!({})).unwrap();
    assert_eq!(fixture.take_log(), vec!["effect:right"]);

    ctx(&main, &["left"]).broadcast(&ping(), &json!({})).unwrap();
    assert_eq!(
        fixture.take_log(),
        vec!["intercept:left", "intercept:right", "intercept:left", "intercept:right"]
    );
}

#[test]
fn global_props_flow_down_and_stay_read_only_for_components() {
    let fixture = Fixture::new();
    let page = fixture.page("main");
    let left = ctx(&page, &["left"]);
    assert_eq!(left.get::<String>("accent").unwrap(), "green");
    assert_eq!(fixture.theme.dependant_count("accent"), 2);

    fixture
        .theme
        .update_state("accent", |state| {
            state.set("accent", "blue")?;
            Ok(Reduction::Updated)
        })
        .unwrap();
    assert_eq!(left.get::<String>("accent").unwrap(), "blue");
    assert_eq!(ctx(&page, &["right"]).get::<String>("accent").unwrap(), "blue");

    let write = left.update_state("recolor", |state| {
        state.set("accent", "red")?;
        Ok(Reduction::Updated)
    });
    assert!(write.is_err());
    assert_eq!(fixture.theme.get::<String>("accent").unwrap(), "blue");

    page.destroy();
    assert_eq!(fixture.theme.dependant_count("accent"), 0);
}

#[test]
fn children_aliasing_a_global_bound_parent_prop_follow_the_global() {
    let fixture = Fixture::new();
    let shell = Shell {
        log: Rc::clone(&fixture.log),
    };
    let connector = Connector::new().bind_global(&fixture.theme, "accent", "accent");
    let page = Page::new(&fixture.runtime, "shell", Dependant::new(shell, connector)).unwrap();
    page.on_lifecycle(LifecycleEvent::Create);
    let inner = ctx(&page, &["inner"]);
    assert_eq!(inner.get::<String>("accent").unwrap(), "green");
    assert_eq!(fixture.theme.dependant_count("accent"), 2);

    fixture
        .theme
        .update_state("accent", |state| {
            state.set("accent", "red")?;
            Ok(Reduction::Updated)
        })
        .unwrap();

    assert_eq!(ctx(&page, &[]).get::<String>("accent").unwrap(), "red");
    assert_eq!(inner.get::<String>("accent").unwrap(), "red");
    assert_eq!(page.store().pending_keys(inner.token()), vec!["accent".to_string()]);

    page.destroy();
    assert_eq!(fixture.theme.dependant_count("accent"), 0);
    assert_eq!(fixture.theme.observer_count(), 0);
}

struct Audit {
    log: Log,
}

impl Middleware for Audit {
    fn dispatch(&self, scope: StateToken, action: &Action, payload: &Payload, next: Next<'_>) -> canopy::Result<()> {
        self.log
            .borrow_mut()
            .push(format!("{} over {} states", action.name(), next.states().len()));
        next.run(scope, action, payload)
    }
}

#[test]
fn page_middleware_sees_component_reducer_dispatches() {
    let fixture = Fixture::new();
    let page = fixture.page("main");
    page.add_middleware(Audit {
        log: Rc::clone(&fixture.log),
    });
    let hub = ctx(&page, &[]);

    hub.dispatch_reducer(&Action::private("bump"), &Payload::Null).unwrap();

    assert_eq!(hub.get::<i64>("count").unwrap(), 1);
    assert_eq!(fixture.take_log(), vec!["bump over 3 states"]);
}

#[test]
fn watchers_see_changes_right_after_the_dispatch() {
    let fixture = Fixture::new();
    let page = fixture.page("main");
    let hub = ctx(&page, &[]);
    let seen: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));

    let sink = Rc::clone(&seen);
    hub.watch(["count"], move |_, changes| {
        for change in changes {
            sink.borrow_mut().push(change.value.as_i64().unwrap_or_default());
        }
    })
    .unwrap();

    hub.dispatch_reducer(&Action::private("bump"), &Payload::Null).unwrap();
    hub.dispatch_reducer(&Action::private("bump"), &Payload::Null).unwrap();

    assert_eq!(*seen.borrow(), vec![1, 2]);
}

#[test]
fn destroyed_pages_drop_out_of_the_runtime() {
    let fixture = Fixture::new();
    let page = fixture.page("main");
    assert_eq!(fixture.runtime.page_count(), 1);

    page.on_lifecycle(LifecycleEvent::Destroy);

    assert!(page.is_destroyed());
    assert_eq!(fixture.runtime.page_count(), 0);
    assert!(ctx_is_gone(&page));
}

fn ctx_is_gone(page: &Page) -> bool {
    page.root().is_none()
}
