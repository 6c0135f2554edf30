//! # Error Classification
//!
//! Failures coming out of the run and secret managers carry two independent
//! annotations:
//!
//! - **recoverable**: whether retrying the same operation may succeed
//! - **class**: the [`RunResult`] the failure maps to on the `PipelineRun`
//!
//! Annotations are stored in an [`Annotated`] wrapper placed inside the
//! `anyhow` chain. Lookups walk the chain from the outermost error inward and
//! return the first wrapper carrying the requested annotation, so wrapping
//! again with a new value overrides whatever an inner layer said.

pub mod k8s;

use crate::crds::RunResult;
use std::error::Error as StdError;
use std::fmt;

/// Error wrapper carrying classification annotations
///
/// Display and `source` are transparent: the wrapper prints as its cause and
/// continues the chain with the cause's own source.
#[derive(Debug)]
pub struct Annotated {
    cause: anyhow::Error,
    recoverable: Option<bool>,
    class: Option<RunResult>,
}

impl Annotated {
    pub fn recoverable(&self) -> Option<bool> {
        self.recoverable
    }

    pub fn class(&self) -> Option<RunResult> {
        self.class
    }
}

impl fmt::Display for Annotated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.cause, f)
    }
}

impl StdError for Annotated {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.source()
    }
}

/// Wraps `err`, merging into an existing outermost wrapper instead of
/// stacking a second one directly on top of it.
fn annotate(
    err: anyhow::Error,
    recoverable: Option<bool>,
    class: Option<RunResult>,
) -> anyhow::Error {
    let outermost_is_annotated = err
        .chain()
        .next()
        .is_some_and(|outer| outer.is::<Annotated>());

    let err = if outermost_is_annotated {
        match err.downcast::<Annotated>() {
            Ok(inner) => {
                return anyhow::Error::new(Annotated {
                    cause: inner.cause,
                    recoverable: recoverable.or(inner.recoverable),
                    class: class.or(inner.class),
                });
            }
            Err(err) => err,
        }
    } else {
        err
    };

    anyhow::Error::new(Annotated {
        cause: err,
        recoverable,
        class,
    })
}

/// Marks `err` as recoverable
pub fn recoverable(err: impl Into<anyhow::Error>) -> anyhow::Error {
    recoverable_if(err, true)
}

/// Marks `err` as non-recoverable
pub fn non_recoverable(err: impl Into<anyhow::Error>) -> anyhow::Error {
    recoverable_if(err, false)
}

/// Marks `err` with the given recoverability.
///
/// Returns `err` itself when its recoverability already equals `cond`.
pub fn recoverable_if(err: impl Into<anyhow::Error>, cond: bool) -> anyhow::Error {
    let err = err.into();
    if is_recoverable(&err) == cond {
        return err;
    }
    annotate(err, Some(cond), None)
}

/// Returns the outermost recoverability annotation, `false` if there is none
pub fn is_recoverable(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(flag) = cause
            .downcast_ref::<Annotated>()
            .and_then(Annotated::recoverable)
        {
            return flag;
        }
    }
    false
}

/// Attaches an outcome class to `err`.
///
/// Returns `err` itself when its class already equals `class`.
pub fn classify(err: impl Into<anyhow::Error>, class: RunResult) -> anyhow::Error {
    let err = err.into();
    if get_class(&err) == class {
        return err;
    }
    annotate(err, None, Some(class))
}

/// Returns the outermost outcome class, `Undefined` if there is none
pub fn get_class(err: &anyhow::Error) -> RunResult {
    for cause in err.chain() {
        if let Some(class) = cause
            .downcast_ref::<Annotated>()
            .and_then(Annotated::class)
        {
            return class;
        }
    }
    RunResult::Undefined
}

/// Finds the first error of type `T` along the chain, looking through
/// classification wrappers.
pub fn find_cause<T>(err: &anyhow::Error) -> Option<&T>
where
    T: StdError + Send + Sync + 'static,
{
    for cause in err.chain() {
        if let Some(found) = cause.downcast_ref::<T>() {
            return Some(found);
        }
        if let Some(found) = cause
            .downcast_ref::<Annotated>()
            .and_then(|annotated| annotated.cause.downcast_ref::<T>())
        {
            return Some(found);
        }
    }
    None
}

/// Classification helpers on `Result`, passing `Ok` through untouched.
pub trait ClassifyExt<T> {
    fn recoverable(self) -> anyhow::Result<T>;
    fn non_recoverable(self) -> anyhow::Result<T>;
    fn recoverable_if(self, cond: bool) -> anyhow::Result<T>;
    fn classify(self, class: RunResult) -> anyhow::Result<T>;
}

impl<T, E> ClassifyExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn recoverable(self) -> anyhow::Result<T> {
        self.map_err(recoverable)
    }

    fn non_recoverable(self) -> anyhow::Result<T> {
        self.map_err(non_recoverable)
    }

    fn recoverable_if(self, cond: bool) -> anyhow::Result<T> {
        self.map_err(|err| recoverable_if(err, cond))
    }

    fn classify(self, class: RunResult) -> anyhow::Result<T> {
        self.map_err(|err| classify(err, class))
    }
}
