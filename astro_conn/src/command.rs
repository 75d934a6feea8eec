//! Outbound commands and the per-connection command queue.
//!
//! Commands wait in a FIFO. The head is promoted to the running slot and
//! stays there until the peer's BOP state lets it go; nothing behind it may
//! overtake it. Every line actually written expects exactly one completion
//! reply, and replies arrive in send order, so the queue keeps a second
//! FIFO of what is awaiting a reply.

use astro::state::{BOP_MASK, BOP_WHILE_STATE};
use std::collections::VecDeque;

/// Opaque handle of whoever asked for a command; completion events are
/// addressed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OriginatorId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
    not_bop: u32,
    originator: Option<OriginatorId>,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            not_bop: 0,
            originator: None,
        }
    }

    /// Hold the command while any of `not_bop` is set in the peer BOP state.
    /// With `BOP_WHILE_STATE` the meaning flips: hold until one of the BOP
    /// bits is set.
    pub fn with_bop(mut self, not_bop: u32) -> Self {
        self.not_bop = not_bop;
        self
    }

    pub fn with_originator(mut self, originator: OriginatorId) -> Self {
        self.originator = Some(originator);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn not_bop(&self) -> u32 {
        self.not_bop
    }

    pub fn originator(&self) -> Option<OriginatorId> {
        self.originator
    }

    pub fn blocked_by(&self, full_bop: u32) -> bool {
        if self.not_bop & BOP_WHILE_STATE != 0 {
            return full_bop & self.not_bop & BOP_MASK == 0;
        }
        full_bop & self.not_bop != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningStatus {
    /// Promoted from the queue, held by BOP.
    Waiting,
    /// On the wire, reply outstanding.
    Send,
    /// Reply received, completion hooks running.
    Returning,
}

#[derive(Debug, Clone)]
enum Pending {
    Running,
    Bypass(Command),
}

#[derive(Debug, Clone, Default)]
pub struct CommandQueue {
    queue: VecDeque<Command>,
    running: Option<(Command, RunningStatus)>,
    awaiting: VecDeque<Pending>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, cmd: Command) {
        self.queue.push_back(cmd);
    }

    pub fn push_front(&mut self, cmd: Command) {
        self.queue.push_front(cmd);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn running(&self) -> Option<(&Command, RunningStatus)> {
        self.running.as_ref().map(|(cmd, status)| (cmd, *status))
    }

    /// Text of the command to write now, if any. The command moves to
    /// `Send` and a reply is expected for it.
    pub fn next_to_send(&mut self, full_bop: u32) -> Option<String> {
        if self.running.is_none() {
            let cmd = self.queue.pop_front()?;
            self.running = Some((cmd, RunningStatus::Waiting));
        }
        let (cmd, status) = self.running.as_mut()?;
        if *status != RunningStatus::Waiting || cmd.blocked_by(full_bop) {
            return None;
        }
        *status = RunningStatus::Send;
        self.awaiting.push_back(Pending::Running);
        Some(cmd.text.clone())
    }

    /// Record a command written outside the queue.
    pub fn send_bypass(&mut self, cmd: Command) {
        self.awaiting.push_back(Pending::Bypass(cmd));
    }

    /// Match a completion reply with the oldest command awaiting one.
    /// A running command moves to `Returning` and stays until
    /// [`finish_running`](Self::finish_running).
    pub fn take_reply(&mut self) -> Option<Command> {
        match self.awaiting.pop_front()? {
            Pending::Bypass(cmd) => Some(cmd),
            Pending::Running => {
                let (cmd, status) = self.running.as_mut()?;
                *status = RunningStatus::Returning;
                Some(cmd.clone())
            }
        }
    }

    pub fn finish_running(&mut self) {
        if matches!(self.running, Some((_, RunningStatus::Returning))) {
            self.running = None;
        }
    }

    /// No backlog and nothing on the wire without its reply.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
            && matches!(self.running, None | Some((_, RunningStatus::Returning)))
    }

    /// Drop queued commands and a running one that never went out.
    /// Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let mut dropped = self.queue.len();
        self.queue.clear();
        if matches!(self.running, Some((_, RunningStatus::Waiting))) {
            self.running = None;
            dropped += 1;
        }
        dropped
    }

    pub fn empty_for_originator(&self, originator: OriginatorId) -> bool {
        let mine = |cmd: &Command| cmd.originator == Some(originator);
        if self.queue.iter().any(mine) {
            return false;
        }
        if let Some((cmd, status)) = &self.running {
            if *status != RunningStatus::Returning && mine(cmd) {
                return false;
            }
        }
        !self.awaiting.iter().any(|p| match p {
            Pending::Bypass(cmd) => mine(cmd),
            Pending::Running => false,
        })
    }

    pub fn originator_pending(&self, originator: OriginatorId) -> bool {
        !self.empty_for_originator(originator)
    }

    /// Forget `originator` on every command; they still run but nobody is
    /// notified.
    pub fn delete_originator(&mut self, originator: OriginatorId) {
        let strip = |cmd: &mut Command| {
            if cmd.originator == Some(originator) {
                cmd.originator = None;
            }
        };
        self.queue.iter_mut().for_each(strip);
        if let Some((cmd, _)) = self.running.as_mut() {
            strip(cmd);
        }
        for pending in self.awaiting.iter_mut() {
            if let Pending::Bypass(cmd) = pending {
                strip(cmd);
            }
        }
    }

    /// The wire is gone: return every command whose reply will never come.
    /// A running command that was never sent goes back to the queue head.
    pub fn abort_in_flight(&mut self) -> Vec<Command> {
        let mut lost = Vec::new();
        for pending in self.awaiting.drain(..) {
            if let Pending::Bypass(cmd) = pending {
                lost.push(cmd);
            }
        }
        match self.running.take() {
            Some((cmd, RunningStatus::Waiting)) => self.queue.push_front(cmd),
            Some((cmd, RunningStatus::Send)) => lost.push(cmd),
            Some((_, RunningStatus::Returning)) | None => {}
        }
        lost
    }
}
