//! Event sources: file descriptors with callbacks, dispatched by the reactor.
//!
//! A source is owned by whoever created it (a [`Timer`](crate::Timer), or
//! an embedder wrapping a socket). The reactor only keeps a weak reference,
//! so dropping the last `Rc` is enough to stop dispatch.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::error::{CoreError, Result};
use crate::timer::TimerCore;

/// What the reactor does with a source once its callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    /// Unregister the source. For timers this also closes the timer fd.
    Remove,
}

/// Callback run on the reactor thread. An `Err` unregisters the source.
pub type SourceCallback = Box<dyn FnMut(&mut Payload) -> Result<Disposition>>;

/// Data carried by a source, tagged by the subsystem that created it.
pub enum Payload {
    Timer(Rc<TimerCore>),
    Opaque(Box<dyn Any>),
}

impl Payload {
    pub fn opaque<T: Any>(data: T) -> Self {
        Payload::Opaque(Box::new(data))
    }

    /// Borrow opaque data as `T`. `None` for timers or a different type.
    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        match self {
            Payload::Opaque(data) => data.downcast_mut(),
            Payload::Timer(_) => None,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Timer(core) => f.debug_tuple("Timer").field(core).finish(),
            Payload::Opaque(_) => f.write_str("Opaque(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Readable,
    /// EPOLLERR or EPOLLHUP.
    Failed,
}

struct Slots {
    on_ready: SourceCallback,
    on_error: SourceCallback,
    payload: Payload,
}

pub struct EventSource {
    fd: RawFd,
    slots: RefCell<Slots>,
}

impl EventSource {
    pub fn new(
        fd: RawFd,
        on_ready: impl FnMut(&mut Payload) -> Result<Disposition> + 'static,
        on_error: impl FnMut(&mut Payload) -> Result<Disposition> + 'static,
        payload: Payload,
    ) -> Rc<Self> {
        Rc::new(Self {
            fd,
            slots: RefCell::new(Slots {
                on_ready: Box::new(on_ready),
                on_error: Box::new(on_error),
                payload,
            }),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_timer(&self) -> bool {
        self.slots
            .try_borrow()
            .is_ok_and(|slots| matches!(slots.payload, Payload::Timer(_)))
    }

    pub(crate) fn dispatch(&self, readiness: Readiness) -> Result<Disposition> {
        let mut slots = self
            .slots
            .try_borrow_mut()
            .map_err(|_| CoreError::ArgumentInvalid("source is already dispatching"))?;
        let Slots {
            on_ready,
            on_error,
            payload,
        } = &mut *slots;
        match readiness {
            Readiness::Readable => on_ready(payload),
            Readiness::Failed => on_error(payload),
        }
    }

    /// Final cleanup after the reactor dropped this source.
    pub(crate) fn retire(&self) {
        let timer = match self.slots.try_borrow() {
            Ok(slots) => match &slots.payload {
                Payload::Timer(core) => Some(Rc::clone(core)),
                Payload::Opaque(_) => None,
            },
            Err(_) => None,
        };
        if let Some(core) = timer {
            core.retire();
        }
    }
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("fd", &self.fd)
            .field("timer", &self.is_timer())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_routes_by_readiness() {
        let source = EventSource::new(
            3,
            |payload| {
                *payload.downcast_mut::<Vec<&str>>().unwrap() = vec!["ready"];
                Ok(Disposition::Keep)
            },
            |payload| {
                payload.downcast_mut::<Vec<&str>>().unwrap().push("error");
                Ok(Disposition::Remove)
            },
            Payload::opaque(Vec::<&str>::new()),
        );

        assert_eq!(source.dispatch(Readiness::Readable).unwrap(), Disposition::Keep);
        assert_eq!(source.dispatch(Readiness::Failed).unwrap(), Disposition::Remove);

        let slots = source.slots.borrow();
        let Payload::Opaque(data) = &slots.payload else {
            panic!("expected opaque payload");
        };
        assert_eq!(data.downcast_ref::<Vec<&str>>().unwrap(), &["ready", "error"]);
    }

    #[test]
    fn downcast_rejects_other_types() {
        let mut payload = Payload::opaque(7u32);
        assert!(payload.downcast_mut::<String>().is_none());
        assert_eq!(payload.downcast_mut::<u32>().copied(), Some(7));
        let source = EventSource::new(
            0,
            |_| Ok(Disposition::Keep),
            |_| Ok(Disposition::Keep),
            payload,
        );
        assert!(!source.is_timer());
    }
}
