use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::pjrc::teensyboot::board::{Board, BoardStatus, Interface};
use crate::pjrc::teensyboot::class::{Capabilities, Capability, MatchTable};
use crate::pjrc::teensyboot::device::{Device, DeviceBus, DeviceEvent, PortOpener};
use crate::pjrc::teensyboot::message::{self, report};
use crate::pjrc::teensyboot::{adjust_timeout, Error, ErrorKind, Result};

#[cfg(windows)]
const DROP_BOARD_DELAY: Duration = Duration::from_millis(15000);
#[cfg(not(windows))]
const DROP_BOARD_DELAY: Duration = Duration::from_millis(8000);

/// Boards about to expire within this window are dropped right away, timers do not have
/// that kind of resolution anyway.
const DROP_RESOLUTION: Duration = Duration::from_millis(20);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

// Shared wait state ------------------------------------------------------------------------------

///
/// Synchronization state shared between a monitor and its boards.
///
/// Every refresh bumps the generation and broadcasts, which is what `Board::wait_for`
/// blocks on from non-monitor threads.
///
pub(crate) struct MonitorShared {
    owner: ThreadId,
    alive: AtomicBool,
    generation: Mutex<u64>,
    cond: Condvar,
}

impl MonitorShared {
    fn new() -> Arc<MonitorShared> {
        Arc::new(MonitorShared {
            owner: std::thread::current().id(),
            alive: AtomicBool::new(true),
            generation: Mutex::new(0),
            cond: Condvar::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests() -> Arc<MonitorShared> {
        MonitorShared::new()
    }

    pub(crate) fn owner(&self) -> ThreadId {
        self.owner
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn set_dead(&self) {
        self.alive.store(false, Ordering::Release);
        self.notify();
    }

    pub(crate) fn generation_lock(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap()
    }

    pub(crate) fn wait_generation<'a>(
        &self,
        guard: MutexGuard<'a, u64>,
        timeout: Option<Duration>,
    ) -> MutexGuard<'a, u64> {
        match timeout {
            Some(timeout) => self.cond.wait_timeout(guard, timeout).unwrap().0,
            None => self.cond.wait(guard).unwrap(),
        }
    }

    fn notify(&self) {
        *self.generation.lock().unwrap() += 1;
        self.cond.notify_all();
    }
}

// Events and callbacks ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BoardEvent {
    /// A new board appeared.
    Added,
    /// The interfaces or identity of a known board changed.
    Changed,
    /// The last interface of a board disappeared, the drop timer is running.
    Disappeared,
    /// The drop delay expired, the board is gone for good.
    Dropped,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum CallbackAction {
    Keep,
    /// Remove this callback; no further callback sees the current event.
    Unregister,
}

pub type BoardCallback = Box<dyn FnMut(&Arc<Board>, BoardEvent) -> Result<CallbackAction> + Send>;

type PendingEvents = Vec<(Arc<Board>, BoardEvent)>;

// Monitor ----------------------------------------------------------------------------------------

///
/// Watches a device bus and aggregates classified interfaces into boards.
///
/// The monitor belongs to the thread which created it: that thread calls `refresh` (or
/// `wait`) to process hotplug events and expire missing boards. Other threads interact
/// through the thread-safe `Board` handles.
///
pub struct Monitor {
    bus: Box<dyn DeviceBus>,
    opener: Arc<dyn PortOpener>,
    match_table: MatchTable,

    boards: Vec<Arc<Board>>,
    ifaces: HashMap<String, Arc<Interface>>,

    callbacks: Vec<(i32, BoardCallback)>,
    next_callback_id: i32,

    drop_delay: Duration,
    shared: Arc<MonitorShared>,
    started: bool,
}

impl Monitor {
    pub fn new(bus: Box<dyn DeviceBus>) -> Monitor {
        Monitor::with_match_table(bus, MatchTable::default())
    }

    pub fn with_match_table(bus: Box<dyn DeviceBus>, match_table: MatchTable) -> Monitor {
        let drop_delay = std::env::var("HALFKAY_DROP_BOARD_DELAY")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DROP_BOARD_DELAY);

        let opener = bus.opener();
        Monitor {
            bus,
            opener,
            match_table,
            boards: Vec::new(),
            ifaces: HashMap::new(),
            callbacks: Vec::new(),
            next_callback_id: 0,
            drop_delay,
            shared: MonitorShared::new(),
            started: false,
        }
    }

    pub fn drop_delay(&self) -> Duration {
        self.drop_delay
    }

    pub fn set_drop_delay(&mut self, delay: Duration) {
        self.drop_delay = delay;
    }

    /// Start monitoring and process the initial enumeration.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        self.started = true;
        if let Err(err) = self.refresh() {
            self.stop();
            return Err(err);
        }

        Ok(())
    }

    pub fn stop(&mut self) {
        if !self.started {
            return;
        }

        self.boards.clear();
        self.ifaces.clear();
        self.started = false;
    }

    ///
    /// Register an ordered board-event callback.
    ///
    /// Callbacks run on the monitor thread in registration order; returning
    /// [`CallbackAction::Unregister`] removes the callback, errors abort the refresh and
    /// surface to its caller.
    ///
    pub fn register_callback(&mut self, callback: BoardCallback) -> i32 {
        let id = self.next_callback_id;
        self.next_callback_id += 1;
        self.callbacks.push((id, callback));
        id
    }

    pub fn deregister_callback(&mut self, id: i32) {
        self.callbacks.retain(|(callback_id, _)| *callback_id != id);
    }

    /// Boards currently online, in discovery order.
    pub fn boards(&self) -> Vec<Arc<Board>> {
        self.boards
            .iter()
            .filter(|board| board.status() == BoardStatus::Online)
            .cloned()
            .collect()
    }

    /// All boards still tracked, missing ones included.
    pub fn all_boards(&self) -> Vec<Arc<Board>> {
        self.boards.clone()
    }

    /// First online board matching the tag filter, `None` matches any board.
    pub fn find_board(&self, filter: Option<&str>) -> Option<Arc<Board>> {
        self.boards().into_iter().find(|board| match filter {
            Some(filter) => board.matches_tag(filter),
            None => true,
        })
    }

    /// Replay the online boards as synthetic ADDED events, for late subscribers.
    pub fn list(&self, mut f: impl FnMut(&Arc<Board>, BoardEvent) -> Result<()>) -> Result<()> {
        for board in self.boards() {
            f(&board, BoardEvent::Added)?;
        }
        Ok(())
    }

    ///
    /// Process one round of drop-timer expiry and hotplug events.
    ///
    /// Wakes up every thread blocked in `Board::wait_for` afterwards, then dispatches the
    /// collected board events to the registered callbacks.
    ///
    pub fn refresh(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        let mut pending = PendingEvents::new();

        self.expire_missing_boards(&mut pending);

        let events = self.bus.refresh()?;
        for event in events {
            match event {
                DeviceEvent::Added(dev) => self.add_device(dev, &mut pending)?,
                DeviceEvent::Removed(path) => self.remove_device(&path, &mut pending),
            }
        }

        self.shared.notify();
        self.dispatch(pending)
    }

    ///
    /// Pump the monitor until the predicate holds or the timeout expires.
    ///
    /// This is the wait path for the monitor-owning thread; it keeps hotplug processing
    /// alive while waiting, which `Board::wait_for` cannot do.
    ///
    pub fn wait(
        &mut self,
        mut predicate: impl FnMut(&mut Monitor) -> Result<bool>,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let start = Instant::now();

        loop {
            self.refresh()?;
            if predicate(self)? {
                return Ok(true);
            }

            let remaining = adjust_timeout(timeout, start);
            if remaining == Some(Duration::ZERO) {
                return Ok(false);
            }

            let mut sleep = remaining.unwrap_or(POLL_INTERVAL).min(POLL_INTERVAL);
            if let Some(deadline) = self.next_drop_deadline() {
                sleep = sleep.min(deadline.saturating_duration_since(Instant::now()));
            }
            std::thread::sleep(sleep);
        }
    }

    /// Wait until the board exposes `cap`, pumping the monitor meanwhile.
    pub fn wait_for(
        &mut self,
        board: &Arc<Board>,
        cap: Capability,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        self.wait(
            |_monitor| {
                if board.status() == BoardStatus::Dropped {
                    return Err(report(Error::NotFound(format!(
                        "Board '{}' has disappeared",
                        board.tag()
                    ))));
                }
                Ok(board.has_capability(cap))
            },
            timeout,
        )
    }

    // Drop timer ---------------------------------------------------------------------------------

    fn expire_missing_boards(&mut self, pending: &mut PendingEvents) {
        let now = Instant::now();
        let drop_delay = self.drop_delay;
        let mut dropped = Vec::new();

        self.boards.retain(|board| {
            let mut st = board.state.lock().unwrap();
            if st.status != BoardStatus::Missing {
                return true;
            }

            let missing_since = match st.missing_since {
                Some(missing_since) => missing_since,
                None => return true,
            };
            let residual = drop_delay.saturating_sub(now.saturating_duration_since(missing_since));
            if residual >= DROP_RESOLUTION {
                return true;
            }

            st.status = BoardStatus::Dropped;
            drop(st);
            dropped.push(board.clone());
            false
        });

        for board in dropped {
            pending.push((board, BoardEvent::Dropped));
        }
    }

    fn next_drop_deadline(&self) -> Option<Instant> {
        self.boards
            .iter()
            .filter_map(|board| board.missing_since())
            .map(|since| since + self.drop_delay)
            .min()
    }

    // Hotplug ------------------------------------------------------------------------------------

    fn add_device(&mut self, dev: Arc<Device>, pending: &mut PendingEvents) -> Result<()> {
        let class = match self.match_table.find(&dev) {
            // This particular device match was disabled by the user
            Some(spec) => match spec.class {
                Some(class) => class,
                None => return Ok(()),
            },
            None => return Ok(()),
        };

        let details = {
            let _mask = message::mask(ErrorKind::NotFound);
            match class.load_interface(&dev) {
                Ok(Some(details)) => details,
                Ok(None) => return Ok(()),
                // Transient enumeration races are not worth failing the refresh for
                Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::Access) => {
                    return Ok(())
                }
                Err(err) => return Err(err),
            }
        };

        let iface = Interface::new(
            class,
            dev.clone(),
            details.name,
            details.capabilities,
            details.model,
            self.opener.clone(),
        );

        let (board, event) = match self.update_or_create_board(&iface, pending)? {
            Some(found) => found,
            None => return Ok(()),
        };
        iface.set_board(&board);

        {
            let mut st = board.state.lock().unwrap();
            st.ifaces.push(iface.clone());
            let caps = iface.capabilities();
            for cap in Capability::ALL {
                if caps.contains(cap.mask()) && st.cap2iface[cap.index()].is_none() {
                    st.cap2iface[cap.index()] = Some(iface.clone());
                }
            }
            st.capabilities |= caps;
            st.status = BoardStatus::Online;
            st.missing_since = None;
        }
        self.ifaces.insert(dev.path.clone(), iface);

        pending.push((board, event));
        Ok(())
    }

    fn update_or_create_board(
        &mut self,
        iface: &Arc<Interface>,
        pending: &mut PendingEvents,
    ) -> Result<Option<(Arc<Board>, BoardEvent)>> {
        let dev = iface.device().clone();
        let existing = self
            .boards
            .iter()
            .find(|board| board.location() == dev.location)
            .cloned();

        let board = match existing {
            Some(board) => {
                let compatible = {
                    let mut st = board.state.lock().unwrap();
                    iface.class().update_board(iface, &mut st, false)?
                };

                if compatible {
                    let vid_pid_changed = {
                        let st = board.state.lock().unwrap();
                        st.vid != dev.vid || st.pid != dev.pid
                    };
                    if vid_pid_changed {
                        // Should not happen unless removal notifications were dropped somewhere
                        if board.status() == BoardStatus::Online {
                            self.close_board(&board, pending);
                        }
                        let mut st = board.state.lock().unwrap();
                        st.vid = dev.vid;
                        st.pid = dev.pid;
                    }

                    return Ok(Some((board, BoardEvent::Changed)));
                }

                // The interface no longer fits the board identity: retire the board and
                // start over with a fresh one at the same location.
                if board.status() == BoardStatus::Online {
                    self.close_board(&board, pending);
                }
                self.drop_board(&board, pending);

                match self.create_board(iface)? {
                    Some(board) => board,
                    None => return Ok(None),
                }
            }
            None => match self.create_board(iface)? {
                Some(board) => board,
                None => return Ok(None),
            },
        };

        Ok(Some((board, BoardEvent::Added)))
    }

    fn create_board(&mut self, iface: &Arc<Interface>) -> Result<Option<Arc<Board>>> {
        let dev = iface.device();
        let board = Board::new(&dev.location, dev.vid, dev.pid, self.shared.clone());

        let accepted = {
            let mut st = board.state.lock().unwrap();
            iface.class().update_board(iface, &mut st, true)?
        };
        if !accepted {
            return Ok(None);
        }

        self.boards.push(board.clone());
        Ok(Some(board))
    }

    fn close_board(&mut self, board: &Arc<Board>, pending: &mut PendingEvents) {
        let orphans = {
            let mut st = board.state.lock().unwrap();
            let orphans = std::mem::take(&mut st.ifaces);
            st.cap2iface = Default::default();
            st.capabilities &= Capabilities::UNIQUE;
            if st.status != BoardStatus::Missing {
                st.status = BoardStatus::Missing;
                st.missing_since = Some(Instant::now());
            }
            orphans
        };

        // Sometimes a board is closed while some interfaces remain, e.g. when its
        // identity changes; those interfaces are forgotten along with it.
        for iface in orphans {
            self.ifaces.remove(iface.path());
        }

        pending.push((board.clone(), BoardEvent::Disappeared));
    }

    fn drop_board(&mut self, board: &Arc<Board>, pending: &mut PendingEvents) {
        board.state.lock().unwrap().status = BoardStatus::Dropped;
        self.boards.retain(|it| !Arc::ptr_eq(it, board));
        pending.push((board.clone(), BoardEvent::Dropped));
    }

    fn remove_device(&mut self, path: &str, pending: &mut PendingEvents) {
        let iface = match self.ifaces.remove(path) {
            Some(iface) => iface,
            None => return,
        };
        let board = match iface.board() {
            Some(board) => board,
            None => return,
        };

        let empty = {
            let mut st = board.state.lock().unwrap();
            st.ifaces.retain(|it| !Arc::ptr_eq(it, &iface));

            // Rebuild the capability map from the remaining interfaces, UNIQUE sticks
            st.cap2iface = Default::default();
            st.capabilities &= Capabilities::UNIQUE;
            for it in st.ifaces.clone() {
                let caps = it.capabilities();
                for cap in Capability::ALL {
                    if caps.contains(cap.mask()) && st.cap2iface[cap.index()].is_none() {
                        st.cap2iface[cap.index()] = Some(it.clone());
                    }
                }
                st.capabilities |= caps;
            }

            st.ifaces.is_empty()
        };

        if empty {
            self.close_board(&board, pending);
        } else {
            pending.push((board, BoardEvent::Changed));
        }
    }

    // Callback dispatch --------------------------------------------------------------------------

    fn dispatch(&mut self, pending: PendingEvents) -> Result<()> {
        for (board, event) in pending {
            let mut unregister = None;

            for (id, callback) in self.callbacks.iter_mut() {
                match callback(&board, event)? {
                    CallbackAction::Keep => {}
                    CallbackAction::Unregister => {
                        unregister = Some(*id);
                        break;
                    }
                }
            }

            if let Some(id) = unregister {
                self.deregister_callback(id);
            }
        }

        Ok(())
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shared.set_dead();
    }
}
