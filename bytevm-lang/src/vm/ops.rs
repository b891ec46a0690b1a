use super::call::{merge_keywords, Arguments};
use super::frame::{BlockKind, Marker, Scope, Why};
use super::function::{Cell, Function};
use super::generator::{Generator, Resumed};
use super::{Fault, Vm};
use crate::code::decode::{Instruction, Operand};
use crate::code::opcode::Opcode;
use crate::code::Code;
use crate::runtime::exception::{ErrorKind, ExceptionTriple};
use crate::runtime::list::{List, Slice};
use crate::runtime::map::{Dict, Set};
use crate::runtime::string;
use crate::runtime::symbol::Symbol;
use crate::runtime::namespace::Namespace;
use crate::runtime::types::{call_special, repr_of, str_of, Class};
use crate::runtime::value::Value;

impl Vm {
    pub(super) fn dispatch(&mut self, instruction: Instruction) -> Result<Option<Why>, Fault> {
        let Instruction {
            opcode, operand, ..
        } = instruction;
        match opcode {
            Opcode::Nop => {}
            Opcode::PopTop => {
                self.pop()?;
            }
            Opcode::RotTwo => {
                let [second, top] = self.pop_array()?;
                self.push(top);
                self.push(second);
            }
            Opcode::RotThree => {
                let [third, second, top] = self.pop_array()?;
                self.push(top);
                self.push(third);
                self.push(second);
            }
            Opcode::DupTop => {
                let top = self.top()?;
                self.push(top);
            }
            Opcode::DupTopTwo => {
                let frame = self.frame_mut();
                let second = frame.peek(2)?.clone();
                let top = frame.peek(1)?.clone();
                frame.push(second);
                frame.push(top);
            }

            Opcode::Unary(op) => {
                let value = self.pop()?;
                let result = op.apply(self, &value)?;
                self.push(result);
            }
            Opcode::Binary(op) => {
                let [lhs, rhs] = self.pop_array()?;
                let result = op.apply(self, &lhs, &rhs)?;
                self.push(result);
            }
            Opcode::Inplace(op) => {
                let [lhs, rhs] = self.pop_array()?;
                let result = op.apply_inplace(self, &lhs, &rhs)?;
                self.push(result);
            }
            Opcode::CompareOp => {
                let Operand::Compare(op) = operand else {
                    return Err(Fault::InvalidOperand);
                };
                let [lhs, rhs] = self.pop_array()?;
                let result = op.apply(self, &lhs, &rhs)?;
                self.push(result);
            }
            Opcode::StoreSubscr => {
                let [value, container, key] = self.pop_array()?;
                container.set_item(self, key, value)?;
            }
            Opcode::DeleteSubscr => {
                let [container, key] = self.pop_array()?;
                container.del_item(self, &key)?;
            }

            Opcode::LoadConst => {
                let Operand::Const(value) = operand else {
                    return Err(Fault::InvalidOperand);
                };
                self.push(value);
            }
            Opcode::LoadName => {
                let name = operand.name()?;
                let value = self
                    .frame()
                    .resolve(name, &[Scope::Locals, Scope::Globals, Scope::Builtins])
                    .ok_or_else(|| Fault::name_error(name))?;
                self.push(value);
            }
            Opcode::StoreName => {
                let value = self.pop()?;
                self.frame().locals.insert(operand.name()?.clone(), value);
            }
            Opcode::DeleteName => {
                let name = operand.name()?;
                self.frame()
                    .locals
                    .remove(name)
                    .ok_or_else(|| Fault::name_error(name))?;
            }
            Opcode::LoadFast => {
                let name = operand.name()?;
                let value = self
                    .frame()
                    .locals
                    .get(name)
                    .ok_or_else(|| Fault::unbound_local(name))?;
                self.push(value);
            }
            Opcode::StoreFast => {
                let value = self.pop()?;
                self.frame().locals.insert(operand.name()?.clone(), value);
            }
            Opcode::DeleteFast => {
                let name = operand.name()?;
                self.frame()
                    .locals
                    .remove(name)
                    .ok_or_else(|| Fault::unbound_local(name))?;
            }
            Opcode::LoadGlobal => {
                let name = operand.name()?;
                let value = self
                    .frame()
                    .resolve(name, &[Scope::Globals, Scope::Builtins])
                    .ok_or_else(|| Fault::name_error(name))?;
                self.push(value);
            }
            Opcode::StoreGlobal => {
                let value = self.pop()?;
                self.frame().globals.insert(operand.name()?.clone(), value);
            }
            Opcode::DeleteGlobal => {
                let name = operand.name()?;
                self.frame()
                    .globals
                    .remove(name)
                    .ok_or_else(|| Fault::name_error(name))?;
            }
            Opcode::LoadClosure => {
                let cell = self.frame().cell(operand.name()?)?.clone();
                self.push(Value::dynamic(cell));
            }
            Opcode::LoadDeref => {
                let value = self.load_deref(operand.name()?)?;
                self.push(value);
            }
            Opcode::LoadClassDeref => {
                let name = operand.name()?;
                let value = match self.frame().locals.get(name) {
                    Some(value) => value,
                    None => self.load_deref(name)?,
                };
                self.push(value);
            }
            Opcode::StoreDeref => {
                let value = self.pop()?;
                self.frame().cell(operand.name()?)?.set(value);
            }
            Opcode::DeleteDeref => {
                let name = operand.name()?;
                if self.frame().cell(name)?.clear().is_none() {
                    return Err(self.unbound_deref(name));
                }
            }

            Opcode::LoadAttr => {
                let target = self.pop()?;
                let value = target.get_attr(self, operand.name()?)?;
                self.push(value);
            }
            Opcode::StoreAttr => {
                let [value, target] = self.pop_array()?;
                target.set_attr(self, operand.name()?.clone(), value)?;
            }
            Opcode::DeleteAttr => {
                let target = self.pop()?;
                target.del_attr(self, operand.name()?)?;
            }

            Opcode::BuildTuple => {
                let items = self.popn(operand.raw()?)?;
                self.push(Value::tuple(items));
            }
            Opcode::BuildList => {
                let items = self.popn(operand.raw()?)?;
                self.push(Value::list(items));
            }
            Opcode::BuildSet => {
                let items = self.popn(operand.raw()?)?;
                self.push(Value::dynamic(Set::from_values(items)?));
            }
            Opcode::BuildMap => {
                let items = self.popn(operand.raw()? * 2)?;
                let dict = Dict::default();
                let mut items = items.into_iter();
                while let (Some(key), Some(value)) = (items.next(), items.next()) {
                    dict.insert(key, value)?;
                }
                self.push(Value::dynamic(dict));
            }
            Opcode::BuildConstKeyMap => {
                let count = operand.raw()?;
                let keys = self.pop()?.collect(self)?;
                let values = self.popn(count)?;
                if keys.len() != count {
                    return Err(Fault::runtime_error("bad BUILD_CONST_KEY_MAP keys argument"));
                }
                let dict = Dict::from_pairs(keys.into_iter().zip(values))?;
                self.push(Value::dynamic(dict));
            }
            Opcode::BuildString => {
                let pieces = self.popn(operand.raw()?)?;
                let mut joined = String::new();
                for piece in &pieces {
                    joined.push_str(&str_of(self, piece)?);
                }
                self.push(Value::from(joined));
            }
            Opcode::BuildSlice => {
                let slice = match operand.raw()? {
                    2 => {
                        let [start, stop] = self.pop_array()?;
                        Slice::new(start, stop, Value::None)
                    }
                    3 => {
                        let [start, stop, step] = self.pop_array()?;
                        Slice::new(start, stop, step)
                    }
                    _ => return Err(Fault::InvalidOperand),
                };
                self.push(Value::dynamic(slice));
            }
            Opcode::BuildTupleUnpack | Opcode::BuildTupleUnpackWithCall => {
                let items = self.unpack_iterables(operand.raw()?)?;
                self.push(Value::tuple(items));
            }
            Opcode::BuildListUnpack => {
                let items = self.unpack_iterables(operand.raw()?)?;
                self.push(Value::list(items));
            }
            Opcode::BuildSetUnpack => {
                let items = self.unpack_iterables(operand.raw()?)?;
                self.push(Value::dynamic(Set::from_values(items)?));
            }
            Opcode::BuildMapUnpack => {
                let mappings = self.popn(operand.raw()?)?;
                let dict = Dict::default();
                for mapping in mappings {
                    for (key, value) in self.mapping_pairs(&mapping)? {
                        dict.insert(key, value)?;
                    }
                }
                self.push(Value::dynamic(dict));
            }
            Opcode::BuildMapUnpackWithCall => {
                let mappings = self.popn(operand.raw()?)?;
                let dict = Dict::default();
                for mapping in mappings {
                    for (key, value) in self.mapping_pairs(&mapping)? {
                        if dict.get(&key)?.is_some() {
                            return Err(Fault::type_error(format!(
                                "got multiple values for keyword argument '{key}'"
                            )));
                        }
                        dict.insert(key, value)?;
                    }
                }
                self.push(Value::dynamic(dict));
            }
            Opcode::FormatValue => {
                let flags = operand.raw()?;
                let spec = if flags & 0x04 == 0 {
                    Value::None
                } else {
                    self.pop()?
                };
                let value = self.pop()?;
                let value = match flags & 0x03 {
                    1 => Value::from(str_of(self, &value)?),
                    2 => Value::from(repr_of(self, &value)?),
                    3 => Value::from(string::ascii(&repr_of(self, &value)?)),
                    _ => value,
                };
                let spec = Value::from(spec.as_str().unwrap_or_default());
                let formatted = match call_special(self, &value, "__format__", vec![spec.clone()])? {
                    Some(formatted) => formatted,
                    None if spec.as_str().is_some_and(str::is_empty) => {
                        Value::from(str_of(self, &value)?)
                    }
                    None => Value::from(string::format_value(
                        &value,
                        spec.as_str().unwrap_or_default(),
                    )?),
                };
                self.push(formatted);
            }
            Opcode::ListAppend => {
                let value = self.pop()?;
                let target = self.frame().peek(operand.raw()?)?.clone();
                let list = target.downcast_ref::<List>().ok_or(Fault::InvalidOperand)?;
                list.push(value);
            }
            Opcode::SetAdd => {
                let value = self.pop()?;
                let target = self.frame().peek(operand.raw()?)?.clone();
                let set = target.downcast_ref::<Set>().ok_or(Fault::InvalidOperand)?;
                set.insert(value)?;
            }
            Opcode::MapAdd => {
                let [value, key] = self.pop_array()?;
                let target = self.frame().peek(operand.raw()?)?.clone();
                let dict = target.downcast_ref::<Dict>().ok_or(Fault::InvalidOperand)?;
                dict.insert(key, value)?;
            }
            Opcode::UnpackSequence => {
                let count = operand.raw()?;
                let items = self.pop()?.collect(self)?;
                if items.len() > count {
                    return Err(Fault::value_error(format!(
                        "too many values to unpack (expected {count})"
                    )));
                } else if items.len() < count {
                    return Err(Fault::value_error(format!(
                        "not enough values to unpack (expected {count}, got {})",
                        items.len()
                    )));
                }
                for item in items.into_iter().rev() {
                    self.push(item);
                }
            }
            Opcode::UnpackEx => {
                let arg = operand.raw()?;
                let (before, after) = (arg & 0xFF, arg >> 8);
                let mut items = self.pop()?.collect(self)?;
                if items.len() < before + after {
                    return Err(Fault::value_error(format!(
                        "not enough values to unpack (expected at least {}, got {})",
                        before + after,
                        items.len()
                    )));
                }
                let trailing = items.split_off(items.len() - after);
                let middle = items.split_off(before);
                for item in trailing.into_iter().rev() {
                    self.push(item);
                }
                self.push(Value::list(middle));
                for item in items.into_iter().rev() {
                    self.push(item);
                }
            }

            Opcode::JumpForward | Opcode::JumpAbsolute => self.jump(operand.jump()?),
            Opcode::PopJumpIfFalse => {
                let value = self.pop()?;
                if !value.truthy(self)? {
                    self.jump(operand.jump()?);
                }
            }
            Opcode::PopJumpIfTrue => {
                let value = self.pop()?;
                if value.truthy(self)? {
                    self.jump(operand.jump()?);
                }
            }
            Opcode::JumpIfFalseOrPop => {
                let value = self.top()?;
                if value.truthy(self)? {
                    self.pop()?;
                } else {
                    self.jump(operand.jump()?);
                }
            }
            Opcode::JumpIfTrueOrPop => {
                let value = self.top()?;
                if value.truthy(self)? {
                    self.jump(operand.jump()?);
                } else {
                    self.pop()?;
                }
            }
            Opcode::GetIter => {
                let iterable = self.pop()?;
                let iterator = iterable.iterate(self)?;
                self.push(iterator);
            }
            Opcode::GetYieldFromIter => {
                let iterable = self.top()?;
                if !iterable.is::<Generator>() {
                    let iterator = iterable.iterate(self)?;
                    self.pop()?;
                    self.push(iterator);
                }
            }
            Opcode::ForIter => {
                let iterator = self.top()?;
                match iterator.next(self)? {
                    Some(value) => self.push(value),
                    None => {
                        self.pop()?;
                        self.jump(operand.jump()?);
                    }
                }
            }

            Opcode::SetupLoop => self.frame_mut().push_block(BlockKind::Loop, operand.jump()?),
            Opcode::SetupExcept => self
                .frame_mut()
                .push_block(BlockKind::SetupExcept, operand.jump()?),
            Opcode::SetupFinally => self
                .frame_mut()
                .push_block(BlockKind::Finally, operand.jump()?),
            Opcode::PopBlock => {
                let frame = self.frame_mut();
                let block = frame.pop_block()?;
                frame.truncate(block.level);
            }
            Opcode::PopExcept => {
                let block = self.frame_mut().pop_block()?;
                if block.kind != BlockKind::ExceptHandler {
                    return Err(Fault::BlockMismatch);
                }
                self.unwind_except_handler(block)?;
            }
            Opcode::BreakLoop => return Ok(Some(Why::Break)),
            Opcode::ContinueLoop => {
                self.return_value = Value::try_from(operand.jump()?)?;
                return Ok(Some(Why::Continue));
            }
            Opcode::EndFinally => return self.end_finally(),
            Opcode::RaiseVarargs => return self.raise(operand.raw()?),
            Opcode::ReturnValue => {
                self.return_value = self.pop()?;
                return Ok(Some(Why::Return));
            }
            Opcode::YieldValue => {
                self.return_value = self.pop()?;
                return Ok(Some(Why::Yield));
            }
            Opcode::YieldFrom => return self.yield_from(),

            Opcode::SetupWith => self.setup_with(operand.jump()?)?,
            Opcode::WithCleanupStart => self.with_cleanup_start()?,
            Opcode::WithCleanupFinish => {
                let [exception, result] = self.pop_array()?;
                if !exception.is_none() && result.truthy(self)? {
                    self.push(Value::dynamic(Marker::Silenced));
                }
            }

            Opcode::MakeFunction => self.make_function(operand.raw()?)?,
            Opcode::CallFunction => {
                let positional = self.popn(operand.raw()?)?;
                let callable = self.pop()?;
                self.call_and_push(&callable, Arguments::new(positional))?;
            }
            Opcode::CallFunctionKw => {
                let names = self.pop()?.collect(self)?;
                let mut positional = self.popn(operand.raw()?)?;
                let values = positional.split_off(
                    positional
                        .len()
                        .checked_sub(names.len())
                        .ok_or(Fault::StackUnderflow)?,
                );
                let keywords = names
                    .into_iter()
                    .zip(values)
                    .map(|(name, value)| {
                        name.as_symbol()
                            .cloned()
                            .map(|name| (name, value))
                            .ok_or(Fault::InvalidOperand)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let callable = self.pop()?;
                self.call_and_push(
                    &callable,
                    Arguments {
                        positional,
                        keywords,
                    },
                )?;
            }
            Opcode::CallFunctionEx => {
                let keywords = if operand.raw()? & 0x01 == 0 {
                    Vec::new()
                } else {
                    let mapping = self.pop()?;
                    self.keyword_pairs(&mapping)?
                };
                let positional = self.pop()?;
                let positional = self.star_args(&positional)?;
                let callable = self.pop()?;
                self.call_and_push(
                    &callable,
                    Arguments {
                        positional,
                        keywords,
                    },
                )?;
            }
            Opcode::CallFunctionVar => self.call_legacy(operand.raw()?, true, false)?,
            Opcode::CallFunctionVarKw => self.call_legacy(operand.raw()?, true, true)?,

            Opcode::LoadBuildClass => {
                let build_class = self
                    .frame()
                    .resolve(&Symbol::from("__build_class__"), &[Scope::Builtins])
                    .ok_or_else(|| Fault::error(ErrorKind::NameError, "__build_class__ not found"))?;
                self.push(build_class);
            }
            Opcode::SetupAnnotations => {
                let locals = self.frame().locals.clone();
                let name = Symbol::from("__annotations__");
                if !locals.contains(&name) {
                    locals.insert(name, Value::dynamic(Dict::default()));
                }
            }
            Opcode::StoreAnnotation => {
                let value = self.pop()?;
                let annotations = self
                    .frame()
                    .locals
                    .get(&Symbol::from("__annotations__"))
                    .ok_or_else(|| Fault::error(ErrorKind::NameError, "__annotations__ not found"))?;
                annotations.set_item(self, Value::Str(operand.name()?.clone()), value)?;
            }
            Opcode::PrintExpr => {
                let value = self.pop()?;
                if !value.is_none() {
                    let mut line = repr_of(self, &value)?;
                    line.push('\n');
                    self.write_output(&line)?;
                    self.builtins().insert(Symbol::from("_"), value);
                }
            }
            Opcode::ImportName => {
                let [level, fromlist] = self.pop_array()?;
                let level = level.as_usize().ok_or_else(|| {
                    Fault::value_error("level must be >= 0")
                })?;
                let module = self.import_name(operand.name()?, &fromlist, level)?;
                self.push(module);
            }
            Opcode::ImportFrom => {
                let module = self.top()?;
                let value = self.import_from(&module, operand.name()?)?;
                self.push(value);
            }
            Opcode::ImportStar => {
                let module = self.pop()?;
                self.import_star(&module)?;
            }

            Opcode::ExtendedArg => return Err(Fault::UnsupportedOpcode(opcode)),
        }
        Ok(None)
    }

    fn push(&mut self, value: Value) {
        self.frame_mut().push(value);
    }

    fn pop(&mut self) -> Result<Value, Fault> {
        self.frame_mut().pop()
    }

    fn popn(&mut self, count: usize) -> Result<Vec<Value>, Fault> {
        self.frame_mut().popn(count)
    }

    fn pop_array<const N: usize>(&mut self) -> Result<[Value; N], Fault> {
        self.frame_mut().pop_array()
    }

    fn top(&self) -> Result<Value, Fault> {
        self.frame().top().cloned()
    }

    fn jump(&mut self, target: usize) {
        self.frame_mut().pc = target;
    }

    fn call_and_push(&mut self, callable: &Value, args: Arguments) -> Result<(), Fault> {
        let result = self.invoke(callable, args)?;
        self.push(result);
        Ok(())
    }

    fn load_deref(&self, name: &Symbol) -> Result<Value, Fault> {
        self.frame()
            .cell(name)?
            .get()
            .ok_or_else(|| self.unbound_deref(name))
    }

    fn unbound_deref(&self, name: &Symbol) -> Fault {
        if self.frame().code.cellvars.contains(name) {
            Fault::unbound_local(name)
        } else {
            Fault::error(
                ErrorKind::NameError,
                format!("free variable '{name}' referenced before assignment in enclosing scope"),
            )
        }
    }

    /// Concatenates the items of the top `count` iterables.
    fn unpack_iterables(&mut self, count: usize) -> Result<Vec<Value>, Fault> {
        let iterables = self.popn(count)?;
        let mut items = Vec::new();
        for iterable in iterables {
            items.extend(iterable.collect(self)?);
        }
        Ok(items)
    }

    fn mapping_pairs(&mut self, mapping: &Value) -> Result<Vec<(Value, Value)>, Fault> {
        if let Some(dict) = mapping.downcast_ref::<Dict>() {
            return Ok(dict.pairs());
        }
        if let Some(namespace) = mapping.downcast_ref::<Namespace>() {
            return Ok(namespace
                .pairs()
                .into_iter()
                .map(|(name, value)| (Value::Str(name), value))
                .collect());
        }
        let keys = mapping
            .get_attr(self, &Symbol::from("keys"))
            .map_err(|_| {
                Fault::type_error(format!(
                    "'{}' object is not a mapping",
                    mapping.type_name()
                ))
            })?
            .call(self, Arguments::default())?
            .collect(self)?;
        keys.into_iter()
            .map(|key| {
                let value = mapping.get_item(self, &key)?;
                Ok((key, value))
            })
            .collect()
    }

    fn keyword_pairs(&mut self, mapping: &Value) -> Result<Vec<(Symbol, Value)>, Fault> {
        self.mapping_pairs(mapping)?
            .into_iter()
            .map(|(key, value)| match key {
                Value::Str(name) => Ok((name, value)),
                _ => Err(Fault::type_error("keywords must be strings")),
            })
            .collect()
    }

    fn star_args(&mut self, value: &Value) -> Result<Vec<Value>, Fault> {
        value.collect(self).map_err(|err| {
            if err.is_exception(ErrorKind::TypeError) {
                Fault::type_error(format!(
                    "argument after * must be an iterable, not {}",
                    value.type_name()
                ))
            } else {
                err
            }
        })
    }

    /// Calls using the variadic encoding where the argument packs the
    /// positional count in its low byte and the keyword pair count in the
    /// next byte.
    fn call_legacy(&mut self, arg: usize, varargs: bool, varkeywords: bool) -> Result<(), Fault> {
        let (pairs, positional_count) = (arg >> 8 & 0xFF, arg & 0xFF);
        let unpacked_keywords = if varkeywords {
            let mapping = self.pop()?;
            self.keyword_pairs(&mapping)?
        } else {
            Vec::new()
        };
        let unpacked_positional = if varargs {
            let sequence = self.pop()?;
            self.star_args(&sequence)?
        } else {
            Vec::new()
        };
        let mut explicit = Vec::with_capacity(pairs);
        for _ in 0..pairs {
            let [name, value] = self.pop_array()?;
            let name = name.as_symbol().cloned().ok_or(Fault::InvalidOperand)?;
            explicit.push((name, value));
        }
        explicit.reverse();
        let mut positional = self.popn(positional_count)?;
        positional.extend(unpacked_positional);
        let callable = self.pop()?;
        self.call_and_push(
            &callable,
            Arguments {
                positional,
                keywords: merge_keywords(explicit, unpacked_keywords),
            },
        )
    }

    fn make_function(&mut self, flags: usize) -> Result<(), Fault> {
        let [code, qualname] = self.pop_array()?;
        let code = code
            .downcast_ref::<Code>()
            .cloned()
            .ok_or(Fault::InvalidOperand)?;
        let qualname = qualname
            .as_symbol()
            .cloned()
            .unwrap_or_else(|| code.name.clone());
        let mut function = Function::new(code, self.frame().globals.clone()).with_qualname(qualname);
        if flags & 0x08 != 0 {
            let closure = self
                .pop()?
                .collect(self)?
                .into_iter()
                .map(|cell| cell.downcast_ref::<Cell>().cloned().ok_or(Fault::InvalidOperand))
                .collect::<Result<Vec<_>, _>>()?;
            function = function.with_closure(closure);
        }
        if flags & 0x04 != 0 {
            function = function.with_annotations(self.pop()?);
        }
        if flags & 0x02 != 0 {
            let kwdefaults = self.pop()?;
            function = function.with_kwdefaults(self.keyword_pairs(&kwdefaults)?);
        }
        if flags & 0x01 != 0 {
            let defaults = self.pop()?.collect(self)?;
            function = function.with_defaults(defaults);
        }
        self.push(Value::dynamic(function));
        Ok(())
    }

    fn end_finally(&mut self) -> Result<Option<Why>, Fault> {
        let status = self.pop()?;
        if status.is_none() {
            return Ok(None);
        }
        if let Some(marker) = status.downcast_ref::<Marker>() {
            return match *marker {
                Marker::Why(why @ (Why::Return | Why::Continue)) => {
                    self.return_value = self.pop()?;
                    Ok(Some(why))
                }
                Marker::Why(why) => Ok(Some(why)),
                Marker::Silenced => {
                    let block = self.frame_mut().pop_block()?;
                    if block.kind != BlockKind::ExceptHandler {
                        return Err(Fault::BlockMismatch);
                    }
                    self.unwind_except_handler(block)?;
                    Ok(None)
                }
            };
        }
        if status
            .downcast_ref::<Class>()
            .is_some_and(Class::is_exception)
        {
            let [traceback, value] = self.pop_array()?;
            self.pending = Some(ExceptionTriple {
                kind: status,
                value,
                traceback,
            });
            return Ok(Some(Why::Reraise));
        }
        Err(Fault::ConfusedEndFinally)
    }

    fn raise(&mut self, argc: usize) -> Result<Option<Why>, Fault> {
        let (exception, cause) = match argc {
            0 => {
                let handled = self
                    .handled
                    .clone()
                    .ok_or_else(|| Fault::runtime_error("No active exception to reraise"))?;
                self.pending = Some(handled);
                return Ok(Some(Why::Reraise));
            }
            1 => (self.pop()?, None),
            2 => {
                let [exception, cause] = self.pop_array()?;
                (exception, Some(cause))
            }
            _ => return Err(Fault::InvalidOperand),
        };
        let triple = ExceptionTriple::raise(self, exception, cause)?;
        if let Some(handled) = &self.handled {
            triple.set_context(handled);
        }
        Err(Fault::Raised(triple))
    }

    fn yield_from(&mut self) -> Result<Option<Why>, Fault> {
        let sent = self.pop()?;
        let receiver = self.top()?;
        let outcome = if let Some(generator) = receiver.downcast_ref::<Generator>() {
            generator.resume(self, sent)
        } else if sent.is_none() {
            receiver.next(self).map(|next| match next {
                Some(value) => Resumed::Yielded(value),
                None => Resumed::Completed(Value::None),
            })
        } else {
            receiver
                .get_attr(self, &Symbol::from("send"))
                .and_then(|send| send.call(self, Arguments::new(vec![sent])))
                .map(Resumed::Yielded)
        };
        let outcome = match outcome {
            Err(fault) => Resumed::Completed(stop_iteration_value(fault)?),
            Ok(outcome) => outcome,
        };
        match outcome {
            Resumed::Yielded(value) => {
                self.return_value = value;
                let frame = self.frame_mut();
                frame.pc = frame.last_offset;
                Ok(Some(Why::Yield))
            }
            Resumed::Completed(value) => {
                self.pop()?;
                self.push(value);
                Ok(None)
            }
        }
    }

    fn setup_with(&mut self, handler: usize) -> Result<(), Fault> {
        let manager = self.pop()?;
        let enter = manager.get_attr(self, &Symbol::from("__enter__"))?;
        let exit = manager.get_attr(self, &Symbol::from("__exit__"))?;
        self.push(exit);
        let entered = enter.call(self, Arguments::default())?;
        self.frame_mut().push_block(BlockKind::With, handler);
        self.push(entered);
        Ok(())
    }

    fn with_cleanup_start(&mut self) -> Result<(), Fault> {
        let status = self.top()?;
        let (exit, exception, value, traceback) = if status.is_none() {
            let [exit, status] = self.pop_array()?;
            self.push(status);
            (exit, Value::None, Value::None, Value::None)
        } else if let Some(marker) = status.downcast_ref::<Marker>() {
            let exit = match marker {
                Marker::Why(Why::Return | Why::Continue) => {
                    let [exit, return_value, status] = self.pop_array()?;
                    self.push(return_value);
                    self.push(status);
                    exit
                }
                _ => {
                    let [exit, status] = self.pop_array()?;
                    self.push(status);
                    exit
                }
            };
            (exit, Value::None, Value::None, Value::None)
        } else {
            let frame = self.frame_mut();
            let exit_index = frame
                .stack
                .len()
                .checked_sub(7)
                .ok_or(Fault::StackUnderflow)?;
            let exit = frame.stack.remove(exit_index);
            let block = frame.blocks.last_mut().ok_or(Fault::BlockMismatch)?;
            if block.kind != BlockKind::ExceptHandler {
                return Err(Fault::BlockMismatch);
            }
            block.level -= 1;
            let exception = frame.peek(1)?.clone();
            let value = frame.peek(2)?.clone();
            let traceback = frame.peek(3)?.clone();
            (exit, exception, value, traceback)
        };
        let result = exit.call(
            self,
            Arguments::new(vec![exception.clone(), value, traceback]),
        )?;
        self.push(exception);
        self.push(result);
        Ok(())
    }
}

/// Extracts the value a `StopIteration` carries, or returns any other fault.
fn stop_iteration_value(fault: Fault) -> Result<Value, Fault> {
    match fault {
        Fault::StopIteration(value) => Ok(value),
        Fault::Error(ErrorKind::StopIteration, value) => Ok(value),
        Fault::Raised(triple) if triple.is_instance_of(ErrorKind::StopIteration) => {
            Ok(triple.stop_iteration_value())
        }
        other => Err(other),
    }
}
