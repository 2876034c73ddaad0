//! Machine event loop.
//!
//! One background thread services every running machine: timer pokes,
//! preemption, device update callbacks, and the reset/power-off
//! transitions. Machines register on start and fall out of the set when
//! they power off. Embedders that want full control disable the thread and
//! drive [`pass_one`] themselves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use once_cell::sync::Lazy;

use crate::machine::{Machine, MachineInner, POWER_ON, POWER_RESET};

struct EventLoop {
    machines: Mutex<Vec<Arc<MachineInner>>>,
    cond: Condvar,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    enabled: AtomicBool,
}

static EVENT_LOOP: Lazy<EventLoop> = Lazy::new(|| EventLoop {
    machines: Mutex::new(Vec::new()),
    cond: Condvar::new(),
    thread: Mutex::new(None),
    enabled: AtomicBool::new(true),
});

/// Disable (or re-enable) the background thread. Call before starting any
/// machine; with the loop disabled, drive machines via [`Machine::run`].
pub fn set_enabled(on: bool) {
    EVENT_LOOP.enabled.store(on, Ordering::Release);
}

/// Wake the loop out of its 10 ms nap (power transitions, new work).
pub fn kick() {
    EVENT_LOOP.cond.notify_all();
}

pub(crate) fn register(m: Arc<MachineInner>) {
    let mut machines = EVENT_LOOP.machines.lock().unwrap();
    if !machines.iter().any(|x| Arc::ptr_eq(x, &m)) {
        machines.push(m);
    }
    drop(machines);
    if EVENT_LOOP.enabled.load(Ordering::Acquire) {
        spawn_thread();
    }
    kick();
}

pub(crate) fn unregister(m: &Arc<MachineInner>) {
    let mut machines = EVENT_LOOP.machines.lock().unwrap();
    machines.retain(|x| !Arc::ptr_eq(x, m));
}

fn spawn_thread() {
    let mut slot = EVENT_LOOP.thread.lock().unwrap();
    if slot.is_some() {
        return;
    }
    let handle = std::thread::Builder::new()
        .name("rvbox-eventloop".into())
        .spawn(|| {
            crate::vma::isolate_thread();
            loop {
                // Snapshot the set first: transitions take the machine
                // lifecycle lock, which must never nest inside the
                // registry lock (start() holds it while registering).
                let snapshot: Vec<Arc<MachineInner>> =
                    EVENT_LOOP.machines.lock().unwrap().clone();
                let mut off: Vec<*const MachineInner> = Vec::new();
                for m in &snapshot {
                    if !service_machine(m) {
                        off.push(Arc::as_ptr(m));
                    }
                }
                let mut machines = EVENT_LOOP.machines.lock().unwrap();
                if !off.is_empty() {
                    machines.retain(|m| !off.contains(&Arc::as_ptr(m)));
                }
                let (guard, _) = EVENT_LOOP
                    .cond
                    .wait_timeout(machines, Duration::from_millis(10))
                    .unwrap();
                drop(guard);
            }
        })
        .expect("event loop thread spawn failed");
    *slot = Some(handle);
}

/// One service pass over a single machine, for manual driving. Returns
/// false once the machine has powered off.
pub fn pass_one(m: &Arc<MachineInner>) -> bool {
    service_machine(m)
}

/// Carry a machine through its current power state. Returns false when the
/// machine left the running set (powered off).
fn service_machine(m: &Arc<MachineInner>) -> bool {
    match m.power.load(Ordering::Acquire) {
        POWER_ON => {
            if m.running.load(Ordering::Acquire) {
                m.service_harts();
                m.mmio_update_all();
            }
            true
        }
        POWER_RESET => {
            let _g = crate::machine::lifecycle_lock();
            m.pause_harts();
            if !Machine::run_reset_handler(m) {
                info!("machine reset vetoed; powering off");
                m.power.store(crate::machine::POWER_OFF, Ordering::Release);
                m.running.store(false, Ordering::Release);
                return false;
            }
            match m.reset_state() {
                Ok(()) => {
                    m.power.store(POWER_ON, Ordering::Release);
                    MachineInner::spawn_harts(m);
                    m.running.store(true, Ordering::Release);
                    true
                }
                Err(e) => {
                    error!("machine reset failed: {}", e);
                    m.power.store(crate::machine::POWER_OFF, Ordering::Release);
                    m.running.store(false, Ordering::Release);
                    false
                }
            }
        }
        _ => {
            // POWER_OFF: stop the harts and drop the machine from the set.
            let _g = crate::machine::lifecycle_lock();
            m.pause_harts();
            m.running.store(false, Ordering::Release);
            false
        }
    }
}

/// Process-exit cleanup: warn about and stop machines still running. The
/// CLI calls this before returning from main.
pub fn shutdown() {
    let mut machines = EVENT_LOOP.machines.lock().unwrap();
    for m in machines.drain(..) {
        warn!("machine still registered at exit; forcing power-off");
        m.power.store(crate::machine::POWER_OFF, Ordering::Release);
        m.pause_harts();
        m.running.store(false, Ordering::Release);
    }
}
