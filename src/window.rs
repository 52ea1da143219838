use anyhow::{Result, ensure};

use crate::frame::{Frame, FrameStack, OneHot};

/// Parallel columns of frame stacks, actions and target frames.
pub type Examples = (Vec<FrameStack>, Vec<OneHot>, Vec<Frame>);

/// Training examples cut from one episode. The three columns are parallel.
#[derive(Debug, Clone, Default)]
pub struct Windowed {
    pub stacks: Vec<FrameStack>,
    pub actions: Vec<OneHot>,
    pub targets: Vec<Frame>,
}

impl Windowed {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn into_columns(self) -> Examples {
        (self.stacks, self.actions, self.targets)
    }
}

/// Slide a window of `history` frames over an episode.
///
/// `actions[i]` is the action that moved `frames[i]` to `frames[i + 1]`.
/// Example `i` stacks `frames[i..i + history]`, pairs it with
/// `actions[i + history - 1]` and targets `frames[i + history]`.
/// Episodes with `frames.len() <= history` yield nothing.
pub fn extend_frames(frames: &[Frame], actions: &[OneHot], history: usize) -> Result<Windowed> {
    ensure!(history > 0, "history length must be positive");
    ensure!(
        actions.len() == frames.len().saturating_sub(1),
        "episode has {} frames but {} actions, expected one action per transition",
        frames.len(),
        actions.len()
    );

    let n = frames.len();
    if n <= history {
        return Ok(Windowed::default());
    }

    let count = n - history;
    let mut out = Windowed {
        stacks: Vec::with_capacity(count),
        actions: Vec::with_capacity(count),
        targets: Vec::with_capacity(count),
    };
    for i in 0..count {
        out.stacks
            .push(FrameStack::new(frames[i..i + history].to_vec())?);
        out.actions.push(actions[i + history - 1]);
        out.targets.push(frames[i + history].clone());
    }
    Ok(out)
}

// =============================================================================
// Online frame history
// =============================================================================

/// Fixed-capacity ring of the most recent frames, used while rolling out a
/// policy. A fresh history is left-padded with copies of the reset frame.
#[derive(Debug, Clone)]
pub struct FrameHistory {
    slots: Vec<Frame>,
    next_slot: usize,
}

impl FrameHistory {
    pub fn filled_with(frame: Frame, capacity: usize) -> Result<Self> {
        ensure!(capacity > 0, "history capacity must be positive");
        Ok(Self {
            slots: vec![frame; capacity],
            next_slot: 0,
        })
    }

    pub fn push(&mut self, frame: Frame) {
        self.slots[self.next_slot] = frame;
        self.next_slot = (self.next_slot + 1) % self.slots.len();
    }

    /// Most recent frame.
    pub fn latest(&self) -> &Frame {
        let cap = self.slots.len();
        &self.slots[(self.next_slot + cap - 1) % cap]
    }

    /// Frames oldest first.
    pub fn stack(&self) -> Result<FrameStack> {
        let cap = self.slots.len();
        let frames = (0..cap)
            .map(|i| self.slots[(self.next_slot + i) % cap].clone())
            .collect();
        FrameStack::new(frames)
    }
}
