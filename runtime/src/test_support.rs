//! Scripted collaborators and effect fixtures for tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::core::types::{EffectId, NormalizedEffectSource};
use crate::io::transport::{GenerationRequest, GenerationTransport, TransportError};
use crate::mount::{CallbackId, MountRef, NodeId};
use crate::sandbox::{EffectEngine, EffectInstance, ExecutionFault, Instantiation, TeardownHandle};

/// One scripted generator response.
#[derive(Debug, Clone)]
pub enum ScriptedStream {
    /// Deliver every fragment, then complete.
    Complete(Vec<String>),
    /// Deliver the fragments, then fail with `error`.
    Broken { fragments: Vec<String>, error: String },
}

impl ScriptedStream {
    pub fn complete<S: AsRef<str>>(fragments: &[S]) -> Self {
        Self::Complete(fragments.iter().map(|f| f.as_ref().to_string()).collect())
    }

    pub fn broken<S: AsRef<str>>(fragments: &[S], error: &str) -> Self {
        Self::Broken {
            fragments: fragments.iter().map(|f| f.as_ref().to_string()).collect(),
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct TransportScript {
    responses: VecDeque<ScriptedStream>,
    requests: Vec<GenerationRequest>,
}

/// Transport that replays queued responses and records every request.
///
/// Clones share the same queue, so a test can keep one to inspect requests.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    script: Rc<RefCell<TransportScript>>,
}

impl ScriptedTransport {
    pub fn new(responses: impl IntoIterator<Item = ScriptedStream>) -> Self {
        let transport = Self::default();
        transport.script.borrow_mut().responses.extend(responses);
        transport
    }

    pub fn push(&self, response: ScriptedStream) {
        self.script.borrow_mut().responses.push_back(response);
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.script.borrow().requests.clone()
    }
}

impl GenerationTransport for ScriptedTransport {
    fn stream(
        &self,
        request: &GenerationRequest,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<(), TransportError> {
        let response = {
            let mut script = self.script.borrow_mut();
            script.requests.push(request.clone());
            script.responses.pop_front()
        };
        match response {
            Some(ScriptedStream::Complete(fragments)) => {
                for fragment in &fragments {
                    on_fragment(fragment);
                }
                Ok(())
            }
            Some(ScriptedStream::Broken { fragments, error }) => {
                for fragment in &fragments {
                    on_fragment(fragment);
                }
                Err(TransportError::Stream(error))
            }
            None => Err(TransportError::Stream("no scripted response left".to_string())),
        }
    }
}

/// How [`ScriptedEngine`] handles the next effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineBehavior {
    /// Mount `children` elements and return a teardown that removes them.
    Declares { children: usize },
    /// Mount `children` elements, then throw.
    Throws { children: usize },
    /// Return a number instead of a teardown function.
    NotCallable,
    /// Panic inside the engine.
    Panics,
}

/// Engine events, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEntry {
    Mounted(EffectId),
    TornDown(EffectId),
}

#[derive(Debug)]
struct EngineState {
    behavior: Cell<EngineBehavior>,
    journal: RefCell<Vec<JournalEntry>>,
    children_at_mount: RefCell<Vec<usize>>,
    pending_at_mount: RefCell<Vec<usize>>,
    fired: Cell<usize>,
}

/// Engine that runs no code and records what the executor asked of it.
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    state: Rc<EngineState>,
}

impl ScriptedEngine {
    pub fn new(behavior: EngineBehavior) -> Self {
        Self {
            state: Rc::new(EngineState {
                behavior: Cell::new(behavior),
                journal: RefCell::new(Vec::new()),
                children_at_mount: RefCell::new(Vec::new()),
                pending_at_mount: RefCell::new(Vec::new()),
                fired: Cell::new(0),
            }),
        }
    }

    pub fn set_behavior(&self, behavior: EngineBehavior) {
        self.state.behavior.set(behavior);
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.journal.borrow().clone()
    }

    /// Mount child count observed at the start of each instantiation.
    pub fn children_at_mount(&self) -> Vec<usize> {
        self.state.children_at_mount.borrow().clone()
    }

    /// Pending mount callbacks observed at the start of each instantiation.
    pub fn pending_at_mount(&self) -> Vec<usize> {
        self.state.pending_at_mount.borrow().clone()
    }

    /// Callbacks fired across all instances.
    pub fn fired(&self) -> usize {
        self.state.fired.get()
    }
}

impl EffectEngine for ScriptedEngine {
    fn instantiate(
        &self,
        id: EffectId,
        _code: &NormalizedEffectSource,
        mount: MountRef,
    ) -> Result<Instantiation, ExecutionFault> {
        let behavior = self.state.behavior.get();
        if behavior == EngineBehavior::Panics {
            panic!("scripted engine panic");
        }

        self.state
            .children_at_mount
            .borrow_mut()
            .push(mount.with(|m| m.child_count()).unwrap_or(0));
        self.state
            .pending_at_mount
            .borrow_mut()
            .push(mount.with(|m| m.pending_callbacks()).unwrap_or(0));
        self.state.journal.borrow_mut().push(JournalEntry::Mounted(id));

        let add_children = |count: usize| {
            mount.with(|m| {
                for _ in 0..count {
                    let node = m.create_element("div");
                    m.append_child(NodeId::ROOT, node);
                }
            });
        };

        let declared = match behavior {
            EngineBehavior::Declares { children } => {
                add_children(children);
                let state = Rc::clone(&self.state);
                let mount = mount.clone();
                Ok(TeardownHandle::declared(move || {
                    mount.with(|m| {
                        m.clear();
                        m.cancel_all_callbacks();
                    });
                    state.journal.borrow_mut().push(JournalEntry::TornDown(id));
                    Ok(())
                }))
            }
            EngineBehavior::Throws { children } => {
                add_children(children);
                Err(ExecutionFault::Threw("Error: scripted throw".to_string()))
            }
            EngineBehavior::NotCallable => Err(ExecutionFault::NotCallable {
                found: "number".to_string(),
            }),
            EngineBehavior::Panics => unreachable!("handled above"),
        };

        Ok(Instantiation {
            declared,
            instance: Box::new(ScriptedInstance {
                state: Rc::clone(&self.state),
            }),
        })
    }
}

struct ScriptedInstance {
    state: Rc<EngineState>,
}

impl EffectInstance for ScriptedInstance {
    fn fire(&mut self, _id: CallbackId, _now_ms: f64) -> Result<(), ExecutionFault> {
        self.state.fired.set(self.state.fired.get() + 1);
        Ok(())
    }
}

/// Effect sources used across tests.
pub mod fixtures {
    /// One element whose `data-frame` attribute counts animation frames.
    pub const PULSE: &str = r#"function createAnimation(container) {
  const dot = document.createElement('div');
  dot.style.width = '10px';
  dot.style.height = '10px';
  container.appendChild(dot);
  let frame = 0;
  let handle = requestAnimationFrame(function step(now) {
    frame += 1;
    dot.setAttribute('data-frame', frame);
    dot.style.opacity = String((Math.sin(now / 200) + 1) / 2);
    handle = requestAnimationFrame(step);
  });
  return function cleanup() {
    cancelAnimationFrame(handle);
    container.removeChild(dot);
  };
}"#;

    /// Mounts three elements, then throws before returning.
    pub const THROWS_AFTER_CHILDREN: &str = r#"function createAnimation(container) {
  for (let i = 0; i < 3; i++) {
    container.appendChild(document.createElement('span'));
  }
  throw new Error('boom');
  return function cleanup() {};
}"#;

    /// Registers and cancels a timeout and an interval.
    pub const CANCELLED_TIMER: &str = r#"function createAnimation(container) {
  const t = setTimeout(() => container.appendChild(document.createElement('b')), 10);
  const i = setInterval(() => container.appendChild(document.createElement('i')), 10);
  clearTimeout(t);
  clearInterval(i);
  return function cleanup() {};
}"#;

    /// Spawns and removes twenty elements per frame without keeping them.
    pub const PARTICLES: &str = r#"function createAnimation(container) {
  let handle = requestAnimationFrame(function spawn(now) {
    for (let i = 0; i < 20; i++) {
      const p = document.createElement('div');
      p.style.left = (i * 5) + 'px';
      p.style.opacity = String(now % 1);
      container.appendChild(p);
      p.remove();
    }
    handle = requestAnimationFrame(spawn);
  });
  return function cleanup() {
    cancelAnimationFrame(handle);
  };
}"#;

    /// Fenced output with an arrow teardown, as models often produce it.
    pub const FENCED_ARROW: &str = "```javascript\nfunction createAnimation(container) {\n  const box = document.createElement('div');\n  container.appendChild(box);\n  const id = setInterval(() => { box.textContent = String(Date.now()); }, 100);\n  return () => {\n    clearInterval(id);\n    container.innerHTML = '';\n  };\n}\n```";

    /// Split into streamed fragments on line boundaries.
    pub fn fragments(source: &str) -> Vec<String> {
        source.split_inclusive('\n').map(str::to_string).collect()
    }
}
