//! Parking lot for suspended script coroutines.
//!
//! Script callbacks run inside their own coroutine so they may `wait` on a
//! promise. A coroutine that yields is parked together with what it yielded:
//! a promise parks it until the promise is ready, anything else parks it
//! until the next wake pass.

use mlua::{AnyUserData, Function, IntoLuaMulti, Lua, MultiValue, Thread, ThreadStatus, Value};

use crate::bridge;
use crate::error::LuaResult;
use crate::promise::{self, DeckPromise, Wake};
use crate::runtime::runtime;

pub enum Sentinel {
    Plain,
    Promise(AnyUserData),
}

impl Sentinel {
    fn from_yielded(values: &MultiValue) -> Self {
        match values.front() {
            Some(v @ Value::UserData(ud)) if bridge::is::<DeckPromise>(v) => {
                Sentinel::Promise(ud.clone())
            }
            _ => Sentinel::Plain,
        }
    }
}

#[derive(Default)]
pub struct Scheduler {
    parked: Vec<(Thread, Sentinel)>,
}

impl Scheduler {
    pub fn len(&self) -> usize {
        self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    fn park(&mut self, thread: Thread, sentinel: Sentinel) {
        self.parked.push((thread, sentinel));
    }
}

#[derive(Debug)]
pub enum CallOutcome {
    Finished(MultiValue),
    Parked,
}

/// Runs `func` in a fresh coroutine. If it yields, the coroutine is parked
/// and resumed by a later [`wake`].
pub fn yieldable_call(lua: &Lua, func: Function, args: impl IntoLuaMulti) -> LuaResult<CallOutcome> {
    let thread = lua.create_thread(func)?;
    let values = thread.resume::<MultiValue>(args)?;
    settle(lua, thread, values)
}

fn settle(lua: &Lua, thread: Thread, values: MultiValue) -> LuaResult<CallOutcome> {
    if thread.status() != ThreadStatus::Resumable {
        return Ok(CallOutcome::Finished(values));
    }
    let sentinel = Sentinel::from_yielded(&values);
    runtime(lua)?.scheduler.borrow_mut().park(thread, sentinel);
    Ok(CallOutcome::Parked)
}

/// One wake pass. Every coroutine parked before the pass is considered at
/// most once; coroutines parked while the pass runs wait for the next one.
pub fn wake(lua: &Lua, clock: i64) -> LuaResult<()> {
    let rt = runtime(lua)?;
    let parked = std::mem::take(&mut rt.scheduler.borrow_mut().parked);

    let mut ready = Vec::new();
    let mut waiting = Vec::new();
    for (thread, sentinel) in parked {
        match &sentinel {
            Sentinel::Plain => ready.push((thread, MultiValue::new())),
            Sentinel::Promise(p) => match promise::poll_wake(lua, p, clock)? {
                Wake::Wait => waiting.push((thread, sentinel)),
                Wake::Resume(values) => ready.push((thread, values)),
            },
        }
    }
    {
        let mut sched = rt.scheduler.borrow_mut();
        for (thread, sentinel) in waiting {
            sched.park(thread, sentinel);
        }
    }

    for (thread, values) in ready {
        let result = thread
            .resume::<MultiValue>(values)
            .and_then(|out| settle(lua, thread, out));
        if let Err(err) = result {
            crate::logger::log_error(lua, &err);
        }
    }
    Ok(())
}

pub fn parked_count(lua: &Lua) -> LuaResult<usize> {
    Ok(runtime(lua)?.scheduler.borrow().len())
}
