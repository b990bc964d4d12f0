use std::collections::HashMap;

use super::{EntryPointKind, Hook, TransformError, TransformStatus};
use crate::dsl::context::ExecutionContext;
use crate::dsl::TransformProgram;
use crate::model::{RecordRef, RuntimeError, Value};

/// A compiled program bound to the lifecycle of one component.
///
/// Global code runs lazily before the first hook. Record-level hooks
/// (`transform`, `append`, `count`) that fail are redirected to their
/// `...OnError` variant when the program declares one.
#[derive(Debug)]
pub struct Transform {
    program: Box<dyn TransformProgram>,
    kind: EntryPointKind,
    ctx: ExecutionContext,
    functions: HashMap<Hook, usize>,
    keep_global_scope: bool,
}

impl Transform {
    pub fn new(
        program: Box<dyn TransformProgram>,
        kind: EntryPointKind,
        ctx: ExecutionContext,
    ) -> Result<Self, TransformError> {
        if let Some(problem) = kind.check(program.symbols()).into_iter().next() {
            return Err(TransformError::Configuration(problem));
        }
        let functions = kind
            .hooks()
            .filter_map(|(hook, _)| {
                program.find_function(hook.name(), &hook.params(kind)).map(|i| (hook, i))
            })
            .collect();
        Ok(Self {
            program,
            kind,
            ctx,
            functions,
            keep_global_scope: false,
        })
    }

    /// Opt in to keeping global variables across `reset()` calls. By
    /// default every reset re-runs the global code.
    pub fn keep_global_scope(mut self, keep: bool) -> Self {
        self.keep_global_scope = keep;
        self
    }

    pub fn kind(&self) -> EntryPointKind {
        self.kind
    }

    pub fn program(&self) -> &dyn TransformProgram {
        self.program.as_ref()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn is_declared(&self, hook: Hook) -> bool {
        self.functions.contains_key(&hook)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Run global code (once) and `init()`. A missing `init()` counts as
    /// success.
    pub fn init(&mut self) -> Result<bool, TransformError> {
        self.ensure_global()?;
        match self.call_optional(Hook::Init)? {
            Some(value) => {
                value.as_bool().map_err(|e| TransformError::runtime(Hook::Init.name(), e))
            }
            None => Ok(true),
        }
    }

    pub fn pre_execute(&mut self) -> Result<(), TransformError> {
        self.ensure_global()?;
        self.call_optional(Hook::PreExecute).map(drop)
    }

    pub fn post_execute(&mut self) -> Result<(), TransformError> {
        self.call_optional(Hook::PostExecute).map(drop)
    }

    pub fn finished(&mut self) -> Result<(), TransformError> {
        self.call_optional(Hook::Finished).map(drop)
    }

    /// Prepare for another run: `clean()`, then fresh globals unless the
    /// global scope is kept.
    pub fn reset(&mut self) -> Result<(), TransformError> {
        self.call_optional(Hook::Clean)?;
        if !self.keep_global_scope {
            log::debug!("resetting global scope");
            self.ctx.reset();
            self.ensure_global()?;
        }
        Ok(())
    }

    // ── Record-level hooks ──────────────────────────────────────────

    /// Reformat: map `inputs` into `outputs`. Denormalize: emit the group
    /// collected by `append`, then run `clean()`.
    pub fn transform(
        &mut self,
        inputs: &[RecordRef],
        outputs: &[RecordRef],
    ) -> Result<TransformStatus, TransformError> {
        if self.kind == EntryPointKind::Normalize {
            return Err(self.unsupported(Hook::Transform));
        }
        let status = self
            .call_record(Hook::Transform, Vec::new(), inputs, outputs)
            .and_then(|value| self.status(Hook::Transform, &value));
        if self.kind == EntryPointKind::Denormalize {
            // The group ends here whether or not transform() succeeded.
            let cleaned = self.call_optional(Hook::Clean);
            let status = status?;
            cleaned?;
            return Ok(status);
        }
        status
    }

    /// Denormalize: add one input record to the current group.
    pub fn append(&mut self, inputs: &[RecordRef]) -> Result<TransformStatus, TransformError> {
        let value = self.call_record(Hook::Append, Vec::new(), inputs, &[])?;
        self.status(Hook::Append, &value)
    }

    /// Normalize: number of output records for `inputs`.
    pub fn count(&mut self, inputs: &[RecordRef]) -> Result<i32, TransformError> {
        let value = self.call_record(Hook::Count, Vec::new(), inputs, &[])?;
        match value {
            Value::Integer(n) => Ok(n),
            other => Err(TransformError::runtime(
                Hook::Count.name(),
                RuntimeError::type_mismatch("integer", other.type_name()),
            )),
        }
    }

    /// Normalize: produce output record `idx` of the current input.
    pub fn transform_at(
        &mut self,
        idx: i32,
        inputs: &[RecordRef],
        outputs: &[RecordRef],
    ) -> Result<TransformStatus, TransformError> {
        if self.kind != EntryPointKind::Normalize {
            return Err(self.unsupported(Hook::Transform));
        }
        let value = self.call_record(Hook::Transform, vec![Value::Integer(idx)], inputs, outputs)?;
        self.status(Hook::Transform, &value)
    }

    // ── Dispatch ────────────────────────────────────────────────────

    fn ensure_global(&mut self) -> Result<(), TransformError> {
        if !self.ctx.is_initialized() {
            log::debug!("running global code ({} mode)", self.program.mode());
            self.program
                .run_global(&mut self.ctx)
                .map_err(|e| TransformError::runtime("<global>", e))?;
        }
        Ok(())
    }

    fn unsupported(&self, hook: Hook) -> TransformError {
        TransformError::Configuration(format!(
            "{} transforms have no function '{}'",
            self.kind,
            hook.signature(self.kind)
        ))
    }

    /// Call a parameterless lifecycle hook if declared.
    fn call_optional(&mut self, hook: Hook) -> Result<Option<Value>, TransformError> {
        let Some(function) = self.functions.get(&hook).copied() else {
            return Ok(None);
        };
        log::debug!("{}()", hook.name());
        self.program
            .execute_function(&mut self.ctx, function, Vec::new(), &[], &[])
            .map(Some)
            .map_err(|e| TransformError::runtime(hook.name(), e))
    }

    fn call_record(
        &mut self,
        hook: Hook,
        args: Vec<Value>,
        inputs: &[RecordRef],
        outputs: &[RecordRef],
    ) -> Result<Value, TransformError> {
        self.ensure_global()?;
        let function = self.functions.get(&hook).copied().ok_or_else(|| self.unsupported(hook))?;
        let result =
            self.program.execute_function(&mut self.ctx, function, args.clone(), inputs, outputs);
        let error = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let handler = hook.on_error().and_then(|h| self.functions.get(&h).map(|i| (h, *i)));
        let Some((on_error, handler)) = handler else {
            return Err(TransformError::runtime(hook.name(), error));
        };
        log::warn!("{}() failed, calling {}(): {}", hook.name(), on_error.name(), error.root());
        let mut error_args =
            vec![Value::String(error.root().to_string()), Value::String(error.stack_trace())];
        error_args.extend(args);
        self.program
            .execute_function(&mut self.ctx, handler, error_args, inputs, outputs)
            .map_err(|e| TransformError::runtime(on_error.name(), e))
    }

    fn status(&self, hook: Hook, value: &Value) -> Result<TransformStatus, TransformError> {
        let Value::Integer(code) = value else {
            let found = value.type_name();
            let mismatch = RuntimeError::type_mismatch("integer", found);
            return Err(TransformError::runtime(hook.name(), mismatch));
        };
        let status = TransformStatus::from_code(*code);
        if status == TransformStatus::Skip {
            log::debug!("{}() skipped the record", hook.name());
        }
        Ok(status)
    }
}
