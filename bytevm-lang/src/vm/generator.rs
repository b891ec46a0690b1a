//! Suspendable frames.

use std::fmt::Debug;

use parking_lot::Mutex;

use crate::runtime::symbol::Symbol;
use crate::runtime::value::{AnyDynamic, CustomType, Value};
use crate::vm::call::Arguments;
use crate::vm::frame::Frame;
use crate::vm::function::{bind_to, NativeFunction};
use crate::vm::{Fault, FrameExit, Vm};

/// The outcome of resuming a [`Generator`].
#[derive(Debug, Clone, PartialEq)]
pub enum Resumed {
    /// The generator yielded a value and may be resumed again.
    Yielded(Value),
    /// The generator returned the value.
    Completed(Value),
}

enum GeneratorState {
    Suspended { frame: Box<Frame>, started: bool },
    Running,
    Finished,
}

/// A generator: a frame that runs until it yields and may be resumed later.
///
/// The generator owns its frame while suspended. While it runs, the frame is
/// on the virtual machine's call stack.
pub struct Generator {
    name: Symbol,
    qualname: Symbol,
    state: Mutex<GeneratorState>,
}

impl Generator {
    pub(crate) fn new(frame: Frame, name: Symbol, qualname: Symbol) -> Self {
        Self {
            name,
            qualname,
            state: Mutex::new(GeneratorState::Suspended {
                frame: Box::new(frame),
                started: false,
            }),
        }
    }

    /// Returns the generator function's name.
    #[must_use]
    pub const fn name(&self) -> &Symbol {
        &self.name
    }

    /// Returns true once the generator has returned or raised.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(*self.state.lock(), GeneratorState::Finished)
    }

    /// Returns true while the generator's frame is executing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), GeneratorState::Running)
    }

    /// Resumes the generator, delivering `sent` as the result of the `yield`
    /// expression it is suspended at.
    pub fn resume(&self, vm: &mut Vm, sent: Value) -> Result<Resumed, Fault> {
        let (mut frame, started) = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, GeneratorState::Running) {
                GeneratorState::Suspended { frame, started } => {
                    if !started && !sent.is_none() {
                        *state = GeneratorState::Suspended { frame, started };
                        return Err(Fault::type_error(
                            "can't send non-None value to a just-started generator",
                        ));
                    }
                    (frame, started)
                }
                GeneratorState::Running => {
                    return Err(Fault::value_error("generator already executing"));
                }
                GeneratorState::Finished => {
                    *state = GeneratorState::Finished;
                    return Ok(Resumed::Completed(Value::None));
                }
            }
        };

        if started {
            frame.push(sent);
        }
        trace!(generator = %self.qualname, started, "resuming generator");
        let result = vm.run_frame(*frame);
        let mut state = self.state.lock();
        match result {
            Ok(FrameExit::Yielded(value, frame)) => {
                *state = GeneratorState::Suspended {
                    frame: Box::new(frame),
                    started: true,
                };
                Ok(Resumed::Yielded(value))
            }
            Ok(FrameExit::Returned(value, _)) => {
                *state = GeneratorState::Finished;
                Ok(Resumed::Completed(value))
            }
            Err(fault) => {
                *state = GeneratorState::Finished;
                Err(fault)
            }
        }
    }

    /// Resumes the generator with `value`, returning the next yielded value.
    /// Completion is reported as `StopIteration` carrying the return value.
    pub fn send(&self, vm: &mut Vm, value: Value) -> Result<Value, Fault> {
        match self.resume(vm, value)? {
            Resumed::Yielded(value) => Ok(value),
            Resumed::Completed(value) => Err(Fault::StopIteration(value)),
        }
    }

    /// Marks the generator finished without running any more of its code.
    pub fn close(&self) -> Result<(), Fault> {
        let mut state = self.state.lock();
        if matches!(*state, GeneratorState::Running) {
            return Err(Fault::value_error("generator already executing"));
        }
        *state = GeneratorState::Finished;
        Ok(())
    }
}

impl Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock() {
            GeneratorState::Suspended { started: false, .. } => "created",
            GeneratorState::Suspended { started: true, .. } => "suspended",
            GeneratorState::Running => "running",
            GeneratorState::Finished => "finished",
        };
        f.debug_struct("Generator")
            .field("qualname", &self.qualname)
            .field("state", &state)
            .finish()
    }
}

fn receiver(args: &mut Arguments, method: &str) -> Result<Value, Fault> {
    if args.positional.is_empty() {
        return Err(Fault::type_error(format!(
            "descriptor '{method}' of 'generator' object needs an argument"
        )));
    }
    Ok(args.positional.remove(0))
}

fn with_generator<R>(
    value: &Value,
    f: impl FnOnce(&Generator) -> Result<R, Fault>,
) -> Result<R, Fault> {
    let generator = value
        .downcast_ref::<Generator>()
        .ok_or_else(|| Fault::type_error("expected a generator"))?;
    f(generator)
}

impl CustomType for Generator {
    fn type_name(&self) -> Symbol {
        Symbol::from("generator")
    }

    fn repr(&self, this: &AnyDynamic) -> String {
        format!("<generator object {} at {:#x}>", self.qualname, this.address())
    }

    fn iterate(&self, _vm: &mut Vm, this: &AnyDynamic) -> Result<Value, Fault> {
        Ok(Value::Dynamic(this.clone()))
    }

    fn next(&self, vm: &mut Vm, _this: &AnyDynamic) -> Result<Option<Value>, Fault> {
        match self.resume(vm, Value::None)? {
            Resumed::Yielded(value) => Ok(Some(value)),
            Resumed::Completed(_) => Ok(None),
        }
    }

    fn get_attr(&self, _vm: &mut Vm, this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        let method = match name.as_str() {
            "__name__" => return Ok(Value::Str(self.name.clone())),
            "__qualname__" => return Ok(Value::Str(self.qualname.clone())),
            "gi_running" => return Ok(Value::Bool(self.is_running())),
            "send" => NativeFunction::method("send", |vm, mut args| {
                let generator = receiver(&mut args, "send")?;
                let [value] = args.exactly("send")?;
                with_generator(&generator, |generator| generator.send(vm, value))
            }),
            "__next__" => NativeFunction::method("__next__", |vm, mut args| {
                let generator = receiver(&mut args, "__next__")?;
                let [] = args.exactly("__next__")?;
                with_generator(&generator, |generator| generator.send(vm, Value::None))
            }),
            "close" => NativeFunction::method("close", |_vm, mut args| {
                let generator = receiver(&mut args, "close")?;
                let [] = args.exactly("close")?;
                with_generator(&generator, Generator::close)?;
                Ok(Value::None)
            }),
            _ => return Err(Fault::no_attribute(&self.type_name(), name)),
        };
        Ok(bind_to(
            Value::dynamic(method),
            &Value::Dynamic(this.clone()),
            None,
        ))
    }
}
