//! Deterministic stand-ins for a recording, its replay and a debugger
//!
//! A [`Recording`] is a scripted list of steps, each executed by one task.
//! [`FakeTimeline`] replays it in both directions and [`FakeSession`] is the
//! materialized state at one position, which doubles as a live session for
//! diversions and emergency debugging. [`ScriptedConnection`] feeds the
//! server a fixed list of requests and records what it sends back.
//!
//! Register layout follows x86-64 gdb numbering: `rax` counts the steps the
//! task has executed, `rsp` is fixed per task and `rip` is the pc of the
//! task's last step.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::PathBuf,
    rc::Rc,
};

use eyre::Result;
use transport::{
    DebuggerConnection, Reply, Request, StopNotification,
    types::{DetachReason, GdbRegister, RegisterValue, Watch, WatchKind},
};

use crate::{
    session::{LiveSession, Session, Timeline},
    types::{
        BreakStatus, EventTime, Mark, ReplayResult, RunCommand, TaskInfo, TaskUid, ThreadGroupUid,
    },
};

pub mod regs {
    use transport::types::GdbRegister;

    pub const RAX: GdbRegister = GdbRegister(0);
    pub const RSP: GdbRegister = GdbRegister(7);
    pub const RIP: GdbRegister = GdbRegister(16);
    pub const EFLAGS: GdbRegister = GdbRegister(17);
}

const GENERAL_REGISTERS: usize = 17;
const INITIAL_PC: u64 = 0x40_0000;
const STACK_BASE: u64 = 0x7ffd_0000_0000;
/// Reads at or above this address fail as unmapped
pub const UNMAPPED_BASE: u64 = 0x8000_0000_0000;

/// One scripted unit of execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedStep {
    pub tid: i32,
    pub pc: u64,
    pub completes_event: bool,
    pub exec: bool,
    pub write: Option<(u64, Vec<u8>)>,
    pub signal: Option<i32>,
    pub group_exit: bool,
    pub thread_exit: bool,
}

impl RecordedStep {
    pub fn new(tid: i32, pc: u64) -> Self {
        Self {
            tid,
            pc,
            completes_event: false,
            exec: false,
            write: None,
            signal: None,
            group_exit: false,
            thread_exit: false,
        }
    }

    /// The step ends an event
    pub fn event(mut self) -> Self {
        self.completes_event = true;
        self
    }

    /// The step is an exec, which also ends an event
    pub fn exec(mut self) -> Self {
        self.exec = true;
        self.completes_event = true;
        self
    }

    pub fn writes(mut self, addr: u64, data: &[u8]) -> Self {
        self.write = Some((addr, data.to_vec()));
        self
    }

    pub fn signal(mut self, signal: i32) -> Self {
        self.signal = Some(signal);
        self
    }

    /// The task's whole thread group exits after this step
    pub fn group_exit(mut self) -> Self {
        self.group_exit = true;
        self.completes_event = true;
        self
    }

    /// Only this thread exits after the step
    pub fn thread_exit(mut self) -> Self {
        self.thread_exit = true;
        self.completes_event = true;
        self
    }
}

#[derive(Debug, Clone)]
struct RecordedTask {
    tid: i32,
    tgid: i32,
    name: String,
}

/// A scripted recording
#[derive(Debug, Clone, Default)]
pub struct Recording {
    tasks: Vec<RecordedTask>,
    steps: Vec<RecordedStep>,
    memory: BTreeMap<u64, u8>,
    exe: PathBuf,
}

impl Recording {
    pub fn new() -> Self {
        Self {
            exe: PathBuf::from("/usr/bin/debuggee"),
            ..Self::default()
        }
    }

    pub fn task(mut self, tid: i32, tgid: i32, name: &str) -> Self {
        self.tasks.push(RecordedTask {
            tid,
            tgid,
            name: name.to_string(),
        });
        self
    }

    pub fn step(mut self, step: RecordedStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = RecordedStep>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Initial memory contents
    pub fn memory(mut self, addr: u64, data: &[u8]) -> Self {
        for (offset, byte) in data.iter().enumerate() {
            self.memory.insert(addr + offset as u64, *byte);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn timeline(self) -> FakeTimeline {
        FakeTimeline::new(self)
    }

    /// A live process executing the recording from its start
    pub fn live_session(self) -> FakeSession {
        FakeSession::initial(Rc::new(self))
    }
}

fn tuid(tid: i32) -> TaskUid {
    TaskUid { tid, serial: 0 }
}

/// State of the recorded process at one position
#[derive(Debug, Clone)]
pub struct FakeSession {
    recording: Rc<Recording>,
    position: usize,
    event: EventTime,
    tasks: Vec<TaskInfo>,
    registers: BTreeMap<i32, [u64; GENERAL_REGISTERS + 1]>,
    memory: BTreeMap<u64, u8>,
    breakpoints: BTreeSet<Watch>,
}

impl FakeSession {
    fn initial(recording: Rc<Recording>) -> Self {
        let tasks = recording
            .tasks
            .iter()
            .map(|task| TaskInfo {
                tuid: tuid(task.tid),
                tguid: ThreadGroupUid {
                    tgid: task.tgid,
                    serial: 0,
                },
                tid: task.tid,
                tgid: task.tgid,
                name: task.name.clone(),
                execed: false,
            })
            .collect();
        let registers = recording
            .tasks
            .iter()
            .map(|task| {
                let mut values = [0u64; GENERAL_REGISTERS + 1];
                values[regs::RSP.0 as usize] = STACK_BASE + (task.tid as u64) * 0x1_0000;
                values[regs::RIP.0 as usize] = INITIAL_PC;
                values[regs::EFLAGS.0 as usize] = 0x246;
                (task.tid, values)
            })
            .collect();
        Self {
            memory: recording.memory.clone(),
            recording,
            position: 0,
            event: 0,
            tasks,
            registers,
            breakpoints: BTreeSet::new(),
        }
    }

    fn at(recording: &Rc<Recording>, position: usize) -> Self {
        let mut session = Self::initial(Rc::clone(recording));
        for _ in 0..position.min(recording.len()) {
            session.apply_next();
        }
        session
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn pc_of(&self, tid: i32) -> Option<u64> {
        self.registers
            .get(&tid)
            .map(|values| values[regs::RIP.0 as usize])
    }

    /// Execute the next recorded step; `None` at the end of the recording
    fn apply_next(&mut self) -> Option<RecordedStep> {
        let step = self.recording.steps.get(self.position)?.clone();
        if let Some(values) = self.registers.get_mut(&step.tid) {
            values[regs::RIP.0 as usize] = step.pc;
            values[regs::RAX.0 as usize] += 1;
        }
        if let Some((addr, data)) = &step.write {
            for (offset, byte) in data.iter().enumerate() {
                self.memory.insert(addr + offset as u64, *byte);
            }
        }
        let tgid = self
            .tasks
            .iter()
            .find(|task| task.tid == step.tid)
            .map(|task| task.tgid);
        if step.exec {
            for task in self.tasks.iter_mut().filter(|task| Some(task.tgid) == tgid) {
                task.execed = true;
            }
        }
        if step.group_exit {
            self.tasks.retain(|task| Some(task.tgid) != tgid);
        } else if step.thread_exit {
            self.tasks.retain(|task| task.tid != step.tid);
        }
        if step.completes_event {
            self.event += 1;
        }
        self.position += 1;
        Some(step)
    }

    /// Execute one step and describe how it stopped
    fn execute(&mut self, breakpoints: &BTreeSet<Watch>, command: RunCommand) -> Option<(BreakStatus, bool)> {
        let step = self.apply_next()?;
        let mut status = BreakStatus {
            task: Some(tuid(step.tid)),
            singlestep_complete: command == RunCommand::Singlestep,
            signal: step.signal,
            task_exit: step.group_exit,
            ..BreakStatus::default()
        };
        status.breakpoint_hit = breakpoint_at(breakpoints, step.pc);
        if let Some((addr, data)) = &step.write {
            status.watch_hit = breakpoints
                .iter()
                .find(|watch| {
                    matches!(watch.kind, WatchKind::Write | WatchKind::Access)
                        && watch.overlaps(*addr, data.len())
                })
                .copied();
        }
        Some((status, step.completes_event))
    }

    fn check_task(&self, task: TaskUid) -> Result<()> {
        if self.tasks.iter().any(|t| t.tuid == task) {
            Ok(())
        } else {
            eyre::bail!("task {} is not alive", task.tid)
        }
    }
}

fn breakpoint_at(breakpoints: &BTreeSet<Watch>, pc: u64) -> bool {
    breakpoints.iter().any(|watch| {
        matches!(watch.kind, WatchKind::Software | WatchKind::Hardware) && watch.addr == pc
    })
}

impl Session for FakeSession {
    fn tasks(&self) -> Vec<TaskInfo> {
        self.tasks.clone()
    }

    fn current_task(&self) -> Option<TaskInfo> {
        let steps = &self.recording.steps;
        let next = steps
            .get(self.position)
            .or_else(|| steps.last())
            .map(|step| step.tid);
        next.and_then(|tid| self.find_task(tid))
            .or_else(|| self.tasks.first().cloned())
    }

    fn current_event(&self) -> EventTime {
        self.event
    }

    fn registers(&self, task: TaskUid) -> Result<Vec<RegisterValue>> {
        self.check_task(task)?;
        let values = self
            .registers
            .get(&task.tid)
            .ok_or_else(|| eyre::eyre!("no registers for task {}", task.tid))?;
        let mut out: Vec<_> = values[..GENERAL_REGISTERS]
            .iter()
            .enumerate()
            .map(|(n, value)| RegisterValue::new(GdbRegister(n as u32), value.to_le_bytes().to_vec()))
            .collect();
        let eflags = values[regs::EFLAGS.0 as usize] as u32;
        out.push(RegisterValue::new(regs::EFLAGS, eflags.to_le_bytes().to_vec()));
        Ok(out)
    }

    fn write_register(&mut self, task: TaskUid, value: &RegisterValue) -> Result<()> {
        self.check_task(task)?;
        let number = value.register.0 as usize;
        if number > GENERAL_REGISTERS {
            eyre::bail!("no register {number}");
        }
        let parsed = value
            .as_u64()
            .ok_or_else(|| eyre::eyre!("register value does not fit"))?;
        let values = self
            .registers
            .get_mut(&task.tid)
            .ok_or_else(|| eyre::eyre!("no registers for task {}", task.tid))?;
        values[number] = parsed;
        Ok(())
    }

    fn read_memory(&self, task: TaskUid, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.check_task(task)?;
        if addr.saturating_add(len as u64) > UNMAPPED_BASE {
            eyre::bail!("address {addr:#x} is not mapped");
        }
        Ok((0..len as u64)
            .map(|offset| self.memory.get(&(addr + offset)).copied().unwrap_or(0))
            .collect())
    }

    fn write_memory(&mut self, task: TaskUid, addr: u64, data: &[u8]) -> Result<()> {
        self.check_task(task)?;
        if addr.saturating_add(data.len() as u64) > UNMAPPED_BASE {
            eyre::bail!("address {addr:#x} is not mapped");
        }
        for (offset, byte) in data.iter().enumerate() {
            self.memory.insert(addr + offset as u64, *byte);
        }
        Ok(())
    }

    fn auxv(&self, task: TaskUid) -> Result<Vec<u8>> {
        self.check_task(task)?;
        // AT_PAGESZ then AT_NULL
        let mut auxv = Vec::new();
        for value in [6u64, 4096, 0, 0] {
            auxv.extend_from_slice(&value.to_le_bytes());
        }
        Ok(auxv)
    }

    fn exe_image(&self, _task: TaskUid) -> Option<PathBuf> {
        Some(self.recording.exe.clone())
    }

    fn add_breakpoint(&mut self, _task: TaskUid, watch: &Watch) -> Result<()> {
        self.breakpoints.insert(*watch);
        Ok(())
    }

    fn remove_breakpoint(&mut self, _task: TaskUid, watch: &Watch) -> Result<()> {
        self.breakpoints.remove(watch);
        Ok(())
    }
}

impl LiveSession for FakeSession {
    fn as_session(&self) -> &dyn Session {
        self
    }

    fn as_session_mut(&mut self) -> &mut dyn Session {
        self
    }

    fn resume(&mut self, _task: TaskUid, command: RunCommand) -> Result<ReplayResult> {
        let breakpoints = self.breakpoints.clone();
        loop {
            let Some((status, _)) = self.execute(&breakpoints, command) else {
                return Ok(ReplayResult::exited(0));
            };
            if status.any_break() {
                return Ok(ReplayResult::stopped(status));
            }
        }
    }
}

/// What a test can observe about a [`FakeTimeline`] after handing it over
#[derive(Debug, Default)]
pub struct TimelineStats {
    reverse_singlesteps: Cell<usize>,
    diversions_forked: Cell<usize>,
    explicit_checkpoints: RefCell<BTreeMap<Mark, u32>>,
}

impl TimelineStats {
    /// Backward singlesteps actually executed
    pub fn reverse_singlesteps(&self) -> usize {
        self.reverse_singlesteps.get()
    }

    pub fn diversions_forked(&self) -> usize {
        self.diversions_forked.get()
    }

    /// References held on `mark` through explicit checkpoints
    pub fn checkpoint_refs(&self, mark: &Mark) -> u32 {
        self.explicit_checkpoints
            .borrow()
            .get(mark)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_checkpoint_refs(&self) -> u32 {
        self.explicit_checkpoints.borrow().values().sum()
    }
}

/// Replay of a [`Recording`]
pub struct FakeTimeline {
    recording: Rc<Recording>,
    session: FakeSession,
    breakpoints: BTreeSet<Watch>,
    visited: BTreeSet<usize>,
    lazy_reverse: bool,
    fail_diversions: bool,
    stats: Rc<TimelineStats>,
}

impl FakeTimeline {
    pub fn new(recording: Recording) -> Self {
        let recording = Rc::new(recording);
        Self {
            session: FakeSession::initial(Rc::clone(&recording)),
            recording,
            breakpoints: BTreeSet::new(),
            visited: BTreeSet::from([0]),
            lazy_reverse: true,
            fail_diversions: false,
            stats: Rc::new(TimelineStats::default()),
        }
    }

    /// Enable or disable the cache of previously visited positions
    pub fn with_lazy_reverse(mut self, enabled: bool) -> Self {
        self.lazy_reverse = enabled;
        self
    }

    /// Make every diversion fork fail
    pub fn with_failing_diversions(mut self) -> Self {
        self.fail_diversions = true;
        self
    }

    pub fn stats(&self) -> Rc<TimelineStats> {
        Rc::clone(&self.stats)
    }

    fn position(&self) -> usize {
        self.session.position
    }

    fn mark_at(&self, position: usize) -> Mark {
        if position == self.position() {
            return self.current_mark();
        }
        let session = FakeSession::at(&self.recording, position);
        Mark::new(session.event, position as u64)
    }

    fn goto(&mut self, position: usize) {
        self.session = FakeSession::at(&self.recording, position);
        self.visited.insert(position);
    }

    fn step_tid(&self, position: usize) -> Option<i32> {
        self.recording.steps.get(position).map(|step| step.tid)
    }

    /// The stop at position 0 names whichever task runs first, not the caller
    fn recording_start(&self, caller: TaskUid) -> ReplayResult {
        let task = self
            .session
            .current_task()
            .map_or(caller, |info| info.tuid);
        ReplayResult::stopped(BreakStatus {
            task: Some(task),
            at_recording_start: true,
            ..BreakStatus::default()
        })
    }
}

impl Timeline for FakeTimeline {
    fn session(&self) -> &dyn Session {
        &self.session
    }

    fn session_mut(&mut self) -> &mut dyn Session {
        &mut self.session
    }

    fn current_mark(&self) -> Mark {
        Mark::new(self.session.event, self.session.position as u64)
    }

    fn seek(&mut self, mark: &Mark) -> Result<()> {
        let position = mark.ticks() as usize;
        if position > self.recording.len() {
            eyre::bail!("mark {mark:?} is beyond the end of the recording");
        }
        self.goto(position);
        Ok(())
    }

    fn seek_to_before_event(&mut self, event: EventTime) -> Result<()> {
        let wanted = event.saturating_sub(1);
        let mut session = FakeSession::initial(Rc::clone(&self.recording));
        while session.event < wanted {
            if session.apply_next().is_none() {
                eyre::bail!("event {event} is beyond the end of the recording");
            }
        }
        let position = session.position;
        self.goto(position);
        Ok(())
    }

    fn run_forward(&mut self, command: RunCommand) -> Result<ReplayResult> {
        loop {
            let Some((status, completes_event)) = self.session.execute(&self.breakpoints, command)
            else {
                return Ok(ReplayResult::exited(0));
            };
            self.visited.insert(self.position());
            if status.any_break() || completes_event || self.position() == self.recording.len() {
                return Ok(ReplayResult::stopped(status));
            }
        }
    }

    fn run_backward(&mut self, command: RunCommand, task: TaskUid) -> Result<ReplayResult> {
        let position = self.position();
        if position == 0 {
            return Ok(self.recording_start(task));
        }

        match command {
            RunCommand::Singlestep => {
                let target = position - 1;
                self.goto(target);
                self.stats
                    .reverse_singlesteps
                    .set(self.stats.reverse_singlesteps.get() + 1);
                let tid = self.step_tid(target).unwrap_or(task.tid);
                let breakpoint_hit = self
                    .session
                    .pc_of(tid)
                    .is_some_and(|pc| breakpoint_at(&self.breakpoints, pc));
                Ok(ReplayResult::stopped(BreakStatus {
                    task: Some(tuid(tid)),
                    singlestep_complete: true,
                    breakpoint_hit,
                    ..BreakStatus::default()
                }))
            }
            RunCommand::Continue => {
                let hit = (1..position).rev().find(|&q| {
                    breakpoint_at(&self.breakpoints, self.recording.steps[q - 1].pc)
                });
                match hit {
                    Some(q) => {
                        let tid = self.recording.steps[q - 1].tid;
                        self.goto(q);
                        Ok(ReplayResult::stopped(BreakStatus {
                            task: Some(tuid(tid)),
                            breakpoint_hit: true,
                            ..BreakStatus::default()
                        }))
                    }
                    None => {
                        self.goto(0);
                        Ok(self.recording_start(task))
                    }
                }
            }
        }
    }

    fn lazy_reverse_singlestep(&mut self, from: &Mark, task: TaskUid) -> Option<Mark> {
        if !self.lazy_reverse {
            return None;
        }
        let position = usize::try_from(from.ticks()).ok()?;
        let previous = position.checked_sub(1)?;
        if !self.visited.contains(&previous) || self.step_tid(previous) != Some(task.tid) {
            return None;
        }
        // A genuine step would also report the breakpoint; leave those to it
        let pc = FakeSession::at(&self.recording, previous).pc_of(task.tid)?;
        if breakpoint_at(&self.breakpoints, pc) {
            return None;
        }
        Some(self.mark_at(previous))
    }

    fn is_running(&self) -> bool {
        self.position() < self.recording.len()
    }

    fn fork_diversion(&mut self) -> Result<Box<dyn LiveSession>> {
        if self.fail_diversions {
            eyre::bail!("cannot fork diversion");
        }
        self.stats
            .diversions_forked
            .set(self.stats.diversions_forked.get() + 1);
        let mut session = self.session.clone();
        session.breakpoints = self.breakpoints.clone();
        Ok(Box::new(session))
    }

    fn add_explicit_checkpoint(&mut self) -> Mark {
        let mark = self.current_mark();
        *self
            .stats
            .explicit_checkpoints
            .borrow_mut()
            .entry(mark)
            .or_insert(0) += 1;
        mark
    }

    fn remove_explicit_checkpoint(&mut self, mark: &Mark) {
        let mut checkpoints = self.stats.explicit_checkpoints.borrow_mut();
        let Some(refs) = checkpoints.get_mut(mark) else {
            tracing::warn!(?mark, "releasing a mark that holds no reference");
            return;
        };
        *refs -= 1;
        if *refs == 0 {
            checkpoints.remove(mark);
        }
    }

    fn can_add_checkpoint(&self) -> bool {
        true
    }

    fn add_breakpoint(&mut self, _task: TaskUid, watch: &Watch) -> bool {
        self.breakpoints.insert(*watch);
        true
    }

    fn remove_breakpoint(&mut self, _task: TaskUid, watch: &Watch) {
        self.breakpoints.remove(watch);
    }

    fn remove_breakpoints_and_watchpoints(&mut self) {
        self.breakpoints.clear();
    }
}

/// Something the server sent to the debugger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Reply(Reply),
    Stop(StopNotification),
}

/// A debugger that sends a fixed list of requests, then hangs up
#[derive(Debug, Default)]
pub struct ScriptedConnection {
    requests: VecDeque<Request>,
    sent: Vec<Sent>,
}

impl ScriptedConnection {
    pub fn new(requests: impl IntoIterator<Item = Request>) -> Self {
        Self {
            requests: requests.into_iter().collect(),
            sent: Vec::new(),
        }
    }

    pub fn sent(&self) -> &[Sent] {
        &self.sent
    }

    /// Requests the server never read
    pub fn unread(&self) -> usize {
        self.requests.len()
    }
}

impl DebuggerConnection for ScriptedConnection {
    fn receive_request(&mut self) -> Result<Request> {
        Ok(self
            .requests
            .pop_front()
            .unwrap_or(Request::Detach(DetachReason::ConnectionLost)))
    }

    fn send_reply(&mut self, reply: Reply) -> Result<()> {
        self.sent.push(Sent::Reply(reply));
        Ok(())
    }

    fn notify_stop(&mut self, stop: StopNotification) -> Result<()> {
        self.sent.push(Sent::Stop(stop));
        Ok(())
    }
}
