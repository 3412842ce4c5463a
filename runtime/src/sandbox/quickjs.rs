//! QuickJS-backed [`EffectEngine`].
//!
//! Each effect gets its own runtime and context. The only capability the
//! script sees is a `__host` object bound to a weak [`MountRef`]; the prelude
//! wraps it in a small DOM and timer shim and then removes it from the global
//! scope. Every host-to-script call runs under a wall-clock budget enforced by
//! the runtime's interrupt handler.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rquickjs::function::IntoJsFunc;
use rquickjs::{CaughtError, Context, Ctx, Function, Object, Runtime};
use tracing::{debug, error, info, warn};

use crate::core::types::{EffectId, NormalizedEffectSource};
use crate::mount::{CallbackId, MountRef, NodeId};
use crate::sandbox::{EffectEngine, EffectInstance, ExecutionFault, Instantiation, TeardownHandle};

const PRELUDE: &str = include_str!("prelude.js");

/// Tracing target for `console.*` output of effect scripts.
pub const SCRIPT_LOG_TARGET: &str = "effect_runtime::script";

/// Resource bounds applied to every realm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub memory_limit_bytes: usize,
    pub max_stack_bytes: usize,
    pub call_budget: Duration,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 64 * 1024 * 1024,
            max_stack_bytes: 1024 * 1024,
            call_budget: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QuickJsEngine {
    limits: SandboxLimits,
}

impl QuickJsEngine {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }
}

impl EffectEngine for QuickJsEngine {
    fn instantiate(
        &self,
        id: EffectId,
        code: &NormalizedEffectSource,
        mount: MountRef,
    ) -> Result<Instantiation, ExecutionFault> {
        let realm = Realm::open(self.limits, id, mount)?;

        realm.guarded(ExecutionFault::Compile, |ctx| {
            let compile: Function = fx(ctx)?.get("compile")?;
            compile.call::<_, ()>((code.as_str(),))
        })?;

        let declared = realm
            .guarded(ExecutionFault::Threw, |ctx| {
                let mount: Function = fx(ctx)?.get("mount")?;
                mount.call::<_, String>(())
            })
            .and_then(|found| {
                if found == "function" {
                    let teardown_realm = realm.clone();
                    Ok(TeardownHandle::declared(move || {
                        teardown_realm
                            .guarded(ExecutionFault::Threw, |ctx| {
                                let teardown: Function = fx(ctx)?.get("teardown")?;
                                teardown.call::<_, bool>(())
                            })
                            .map(|_| ())
                    }))
                } else {
                    Err(ExecutionFault::NotCallable { found })
                }
            });

        Ok(Instantiation {
            declared,
            instance: Box::new(QuickJsInstance { realm }),
        })
    }
}

struct QuickJsInstance {
    realm: Realm,
}

impl EffectInstance for QuickJsInstance {
    fn fire(&mut self, id: CallbackId, now_ms: f64) -> Result<(), ExecutionFault> {
        self.realm.guarded(ExecutionFault::Threw, |ctx| {
            let fire: Function = fx(ctx)?.get("fire")?;
            fire.call::<_, bool>((f64::from(id.get()), now_ms))
        })?;
        Ok(())
    }
}

/// One effect's runtime, context and call deadline.
#[derive(Clone)]
struct Realm {
    runtime: Runtime,
    context: Context,
    deadline: Arc<Mutex<Option<Instant>>>,
    budget: Duration,
}

impl Realm {
    fn open(limits: SandboxLimits, id: EffectId, mount: MountRef) -> Result<Self, ExecutionFault> {
        let engine = |err: rquickjs::Error| ExecutionFault::Engine(err.to_string());

        let runtime = Runtime::new().map_err(engine)?;
        runtime.set_memory_limit(limits.memory_limit_bytes);
        runtime.set_max_stack_size(limits.max_stack_bytes);

        let deadline: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let watched = Arc::clone(&deadline);
        runtime.set_interrupt_handler(Some(Box::new(move || {
            watched
                .lock()
                .map(|deadline| deadline.is_some_and(|at| Instant::now() >= at))
                .unwrap_or(false)
        })));

        let context = Context::full(&runtime).map_err(engine)?;
        let realm = Self {
            runtime,
            context,
            deadline,
            budget: limits.call_budget,
        };

        realm.guarded(ExecutionFault::Engine, |ctx| {
            let host = host_object(ctx, id, mount)?;
            ctx.globals().set("__host", host)?;
            ctx.eval::<(), _>(PRELUDE)
        })?;
        debug!(effect = %id, "script realm opened");
        Ok(realm)
    }

    /// Run `f` in the context under the call budget, then drain queued jobs.
    ///
    /// Script errors are mapped with `fault`, unless the budget ran out.
    fn guarded<R>(
        &self,
        fault: fn(String) -> ExecutionFault,
        f: impl for<'js> FnOnce(&Ctx<'js>) -> rquickjs::Result<R>,
    ) -> Result<R, ExecutionFault> {
        self.arm();
        let result = self.context.with(|ctx| {
            f(&ctx).map_err(|err| CaughtError::from_error(&ctx, err).to_string())
        });
        if result.is_ok() {
            self.drain_jobs();
        }
        let expired = self.disarm();

        result.map_err(|message| {
            if expired {
                ExecutionFault::Interrupted {
                    budget: self.budget,
                }
            } else {
                fault(message)
            }
        })
    }

    fn drain_jobs(&self) {
        // Bounded so a job queue that keeps refilling cannot spin forever.
        for _ in 0..1024 {
            if !self.runtime.is_job_pending() {
                return;
            }
            if !matches!(self.runtime.execute_pending_job(), Ok(true)) {
                return;
            }
        }
    }

    fn arm(&self) {
        if let Ok(mut deadline) = self.deadline.lock() {
            *deadline = Some(Instant::now() + self.budget);
        }
    }

    /// Clear the deadline, reporting whether it had passed.
    fn disarm(&self) -> bool {
        match self.deadline.lock() {
            Ok(mut deadline) => deadline
                .take()
                .is_some_and(|at| Instant::now() >= at),
            Err(_) => false,
        }
    }
}

fn fx<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    ctx.globals().get("__fx")
}

fn node(raw: f64) -> NodeId {
    if raw.is_finite() && raw >= 0.0 {
        NodeId::from_raw(raw as u32)
    } else {
        NodeId::from_raw(u32::MAX)
    }
}

fn callback(raw: f64) -> CallbackId {
    CallbackId::from_raw(if raw.is_finite() && raw >= 0.0 { raw as u32 } else { 0 })
}

fn define<'js, F, P>(ctx: &Ctx<'js>, host: &Object<'js>, name: &str, f: F) -> rquickjs::Result<()>
where
    F: IntoJsFunc<'js, P> + 'js,
{
    host.set(name, Function::new(ctx.clone(), f)?)
}

/// Build the `__host` object. Every function degrades to a neutral value once
/// the mount point is gone.
fn host_object<'js>(
    ctx: &Ctx<'js>,
    id: EffectId,
    mount: MountRef,
) -> rquickjs::Result<Object<'js>> {
    let host = Object::new(ctx.clone())?;

    let m = mount.clone();
    define(ctx, &host, "create", move |tag: String| -> f64 {
        m.with(|mount| f64::from(mount.create_element(&tag).get()))
            .unwrap_or(-1.0)
    })?;
    let m = mount.clone();
    define(ctx, &host, "retain", move |n: f64| {
        m.with(|mount| mount.retain(node(n)));
    })?;
    let m = mount.clone();
    define(ctx, &host, "release", move |n: f64| {
        m.with(|mount| mount.release(node(n)));
    })?;
    let m = mount.clone();
    define(ctx, &host, "tag", move |n: f64| -> String {
        m.with(|mount| mount.tag(node(n))).flatten().unwrap_or_default()
    })?;
    let m = mount.clone();
    define(ctx, &host, "append", move |parent: f64, child: f64| -> bool {
        m.with(|mount| mount.append_child(node(parent), node(child)))
            .unwrap_or(false)
    })?;
    let m = mount.clone();
    define(
        ctx,
        &host,
        "insertBefore",
        move |parent: f64, child: f64, reference: f64| -> bool {
            m.with(|mount| mount.insert_before(node(parent), node(child), node(reference)))
                .unwrap_or(false)
        },
    )?;
    let m = mount.clone();
    define(ctx, &host, "remove", move |parent: f64, child: f64| -> bool {
        m.with(|mount| mount.remove_child(node(parent), node(child)))
            .unwrap_or(false)
    })?;
    let m = mount.clone();
    define(ctx, &host, "parent", move |n: f64| -> f64 {
        m.with(|mount| mount.parent(node(n)))
            .flatten()
            .map_or(-1.0, |parent| f64::from(parent.get()))
    })?;
    let m = mount.clone();
    define(ctx, &host, "children", move |n: f64| -> Vec<f64> {
        m.with(|mount| {
            mount
                .children(node(n))
                .into_iter()
                .map(|child| f64::from(child.get()))
                .collect()
        })
        .unwrap_or_default()
    })?;
    let m = mount.clone();
    define(
        ctx,
        &host,
        "setStyle",
        move |n: f64, property: String, value: String| {
            m.with(|mount| mount.set_style(node(n), &property, &value));
        },
    )?;
    let m = mount.clone();
    define(ctx, &host, "style", move |n: f64, property: String| -> Option<String> {
        m.with(|mount| mount.style(node(n), &property)).flatten()
    })?;
    let m = mount.clone();
    define(
        ctx,
        &host,
        "setAttr",
        move |n: f64, name: String, value: String| {
            m.with(|mount| mount.set_attribute(node(n), &name, &value));
        },
    )?;
    let m = mount.clone();
    define(ctx, &host, "attr", move |n: f64, name: String| -> Option<String> {
        m.with(|mount| mount.attribute(node(n), &name)).flatten()
    })?;
    let m = mount.clone();
    define(ctx, &host, "removeAttr", move |n: f64, name: String| {
        m.with(|mount| mount.remove_attribute(node(n), &name));
    })?;
    let m = mount.clone();
    define(ctx, &host, "setText", move |n: f64, text: String| {
        m.with(|mount| mount.set_text(node(n), &text));
    })?;
    let m = mount.clone();
    define(ctx, &host, "text", move |n: f64| -> String {
        m.with(|mount| mount.text(node(n))).unwrap_or_default()
    })?;
    let m = mount.clone();
    define(ctx, &host, "size", move |n: f64| -> Vec<f64> {
        let (width, height) = m.with(|mount| mount.node_size(node(n))).unwrap_or((0.0, 0.0));
        vec![width, height]
    })?;
    let m = mount.clone();
    define(ctx, &host, "requestFrame", move || -> f64 {
        m.with(|mount| f64::from(mount.request_frame().get()))
            .unwrap_or(0.0)
    })?;
    let m = mount.clone();
    define(ctx, &host, "schedule", move |delay: f64, repeat: bool| -> f64 {
        m.with(|mount| f64::from(mount.schedule_timer(delay, repeat).get()))
            .unwrap_or(0.0)
    })?;
    let m = mount.clone();
    define(ctx, &host, "cancel", move |raw: f64| -> bool {
        m.with(|mount| mount.cancel_callback(callback(raw)))
            .unwrap_or(false)
    })?;
    let m = mount;
    define(ctx, &host, "now", move || -> f64 {
        m.with(|mount| mount.now()).unwrap_or(0.0)
    })?;
    define(ctx, &host, "log", move |level: String, message: String| {
        match level.as_str() {
            "error" => error!(target: SCRIPT_LOG_TARGET, effect = %id, "{message}"),
            "warn" => warn!(target: SCRIPT_LOG_TARGET, effect = %id, "{message}"),
            "debug" => debug!(target: SCRIPT_LOG_TARGET, effect = %id, "{message}"),
            _ => info!(target: SCRIPT_LOG_TARGET, effect = %id, "{message}"),
        }
    })?;

    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::normalizer::normalize;
    use crate::core::types::EffectSource;
    use crate::mount::MountPoint;
    use crate::sandbox::{SandboxedExecutor, TeardownKind, TeardownOutcome};
    use crate::test_support::fixtures;

    fn executor() -> SandboxedExecutor<QuickJsEngine> {
        SandboxedExecutor::new(QuickJsEngine::default())
    }

    fn code(text: &str) -> NormalizedEffectSource {
        normalize(&EffectSource::new(text))
    }

    #[test]
    fn mounts_and_tears_down_declared_effect() {
        let mount = MountPoint::new(200.0, 100.0);
        let mut effect = executor().execute(EffectId(1), &code(fixtures::PULSE), &mount);

        assert_eq!(effect.fault(), None);
        assert_eq!(effect.teardown_kind(), TeardownKind::Declared);
        assert_eq!(mount.child_count(), 1);
        assert_eq!(mount.pending_callbacks(), 1);

        assert_eq!(effect.teardown(), TeardownOutcome::Completed);
        assert_eq!(mount.child_count(), 0);
        assert_eq!(mount.pending_callbacks(), 0);
    }

    /// Frame callbacks re-request themselves and update the mounted element.
    #[test]
    fn frames_drive_the_effect() {
        let mount = MountPoint::new(200.0, 100.0);
        let mut effect = executor().execute(EffectId(1), &code(fixtures::PULSE), &mount);

        assert_eq!(effect.tick(16.0), 1);
        assert_eq!(effect.tick(32.0), 1);
        assert_eq!(mount.pending_callbacks(), 1);
        let child = mount.children(NodeId::ROOT)[0];
        assert_eq!(mount.attribute(child, "data-frame").as_deref(), Some("2"));
    }

    #[test]
    fn syntax_error_is_a_compile_fault() {
        let mount = MountPoint::new(10.0, 10.0);
        let effect = executor().execute(
            EffectId(1),
            &code("function createAnimation(container) {...return function cleanup() {}}"),
            &mount,
        );
        assert!(matches!(effect.fault(), Some(ExecutionFault::Compile(_))));
        assert!(effect.execution_failed());
    }

    #[test]
    fn throw_keeps_fallback_and_partial_children() {
        let mount = MountPoint::new(10.0, 10.0);
        let mut effect =
            executor().execute(EffectId(1), &code(fixtures::THROWS_AFTER_CHILDREN), &mount);
        assert!(matches!(effect.fault(), Some(ExecutionFault::Threw(_))));
        assert_eq!(effect.teardown_kind(), TeardownKind::Fallback);
        assert_eq!(mount.child_count(), 3);

        effect.teardown();
        assert_eq!(mount.child_count(), 0);
    }

    #[test]
    fn non_function_result_is_not_callable() {
        let mount = MountPoint::new(10.0, 10.0);
        let effect = executor().execute(
            EffectId(1),
            &code("function createAnimation(c) { return 42; }\n// return function cleanup() {}"),
            &mount,
        );
        assert_eq!(
            effect.fault(),
            Some(&ExecutionFault::NotCallable {
                found: "number".to_string()
            })
        );
    }

    #[test]
    fn runaway_loop_is_interrupted() {
        let engine = QuickJsEngine::new(SandboxLimits {
            call_budget: Duration::from_millis(50),
            ..SandboxLimits::default()
        });
        let mount = MountPoint::new(10.0, 10.0);
        let effect = SandboxedExecutor::new(engine).execute(
            EffectId(1),
            &code("function createAnimation(c) { while (true) {} return function cleanup() {}; }"),
            &mount,
        );
        assert!(matches!(
            effect.fault(),
            Some(ExecutionFault::Interrupted { .. })
        ));
    }

    /// The host object is not reachable from effect code.
    #[test]
    fn host_object_is_hidden() {
        let mount = MountPoint::new(10.0, 10.0);
        let effect = executor().execute(
            EffectId(1),
            &code(
                "function createAnimation(c) {\n  if (typeof __host !== 'undefined') throw new Error('leak');\n  return function cleanup() {};\n}",
            ),
            &mount,
        );
        assert_eq!(effect.fault(), None);
    }

    /// Elements the script no longer references leave both the realm and the
    /// arena, so a long-running effect stays within a small memory limit.
    #[test]
    fn discarded_elements_are_released() {
        let engine = QuickJsEngine::new(SandboxLimits {
            memory_limit_bytes: 4 * 1024 * 1024,
            ..SandboxLimits::default()
        });
        let mount = MountPoint::new(200.0, 100.0);
        let mut effect = SandboxedExecutor::new(engine).execute(
            EffectId(1),
            &code(fixtures::PARTICLES),
            &mount,
        );
        assert_eq!(effect.fault(), None);

        for frame in 1..=5000 {
            assert_eq!(effect.tick(f64::from(frame) * 16.0), 1, "frame {frame}");
        }
        assert!(mount.is_empty());
        assert!(mount.node_count() < 2000, "arena holds {} nodes", mount.node_count());

        assert_eq!(effect.teardown(), TeardownOutcome::Completed);
        assert_eq!(mount.pending_callbacks(), 0);
    }

    /// A wrapper that is still referenced keeps its detached element usable.
    #[test]
    fn referenced_detached_element_survives() {
        let mount = MountPoint::new(10.0, 10.0);
        let mut effect = executor().execute(
            EffectId(1),
            &code(
                "function createAnimation(c) {\n  const kept = document.createElement('p');\n  c.appendChild(kept);\n  kept.remove();\n  requestAnimationFrame(() => { kept.textContent = 'back'; c.appendChild(kept); });\n  return function cleanup() {};\n}",
            ),
            &mount,
        );
        assert_eq!(effect.fault(), None);
        assert!(mount.is_empty());

        assert_eq!(effect.tick(16.0), 1);
        let child = mount.children(NodeId::ROOT)[0];
        assert_eq!(mount.text(child), "back");
    }

    #[test]
    fn cancelled_timers_do_not_fire() {
        let mount = MountPoint::new(10.0, 10.0);
        let mut effect = executor().execute(EffectId(1), &code(fixtures::CANCELLED_TIMER), &mount);
        assert_eq!(effect.fault(), None);
        assert_eq!(mount.pending_callbacks(), 0);
        assert_eq!(effect.tick(1000.0), 0);
        assert!(mount.is_empty());
    }
}
