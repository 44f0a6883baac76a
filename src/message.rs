// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Double-buffered per-type message queues. A message survives exactly two
//! `update` rotations (the frame it was sent, and the following one), giving
//! every reader a full frame to observe it regardless of system order.

use ahash::RandomState;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;

/// One type's double-buffered backlog, addressed by a monotonically
/// increasing global sequence number so readers can resume precisely where
/// they left off.
struct MessageQueue<T> {
    previous_frame: Vec<T>,
    current_frame: Vec<T>,
    previous_base: u64,
    current_base: u64,
}

impl<T> MessageQueue<T> {
    fn new() -> Self {
        Self {
            previous_frame: Vec::new(),
            current_frame: Vec::new(),
            previous_base: 0,
            current_base: 0,
        }
    }

    fn send(&mut self, message: T) {
        self.current_frame.push(message);
    }

    fn rotate(&mut self) {
        self.previous_base = self.current_base;
        self.previous_frame = std::mem::take(&mut self.current_frame);
        self.current_base = self.previous_base + self.previous_frame.len() as u64;
    }

    fn tail(&self) -> u64 {
        self.current_base + self.current_frame.len() as u64
    }

    fn read_since<'q>(&'q self, cursor: u64) -> Vec<&'q T> {
        let prev_start = cursor.saturating_sub(self.previous_base).min(self.previous_frame.len() as u64) as usize;
        let cur_start = cursor.saturating_sub(self.current_base).min(self.current_frame.len() as u64) as usize;
        self.previous_frame[prev_start..].iter().chain(self.current_frame[cur_start..].iter()).collect()
    }
}

trait ErasedQueue: Any + Send + Sync {
    fn rotate(&mut self);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Send + Sync + 'static> ErasedQueue for MessageQueue<T> {
    fn rotate(&mut self) {
        MessageQueue::rotate(self);
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A reader's private cursor into one message type's backlog. Independent
/// readers of the same type progress independently.
pub struct MessageReader<T> {
    cursor: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for MessageReader<T> {
    fn default() -> Self {
        Self { cursor: 0, _marker: PhantomData }
    }
}

impl<T> MessageReader<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cursor's current position in the type's logical stream. Two
    /// readers with the same offset have consumed exactly the same prefix.
    pub fn current_offset(&self) -> u64 {
        self.cursor
    }

    /// Rewind (or fast-forward) this reader to an arbitrary offset, e.g. one
    /// earlier obtained from [`MessageReader::current_offset`]. An offset
    /// older than the oldest live frame clamps up to it on the next read,
    /// same as a reader created long ago would.
    pub fn reset_to(&mut self, offset: u64) {
        self.cursor = offset;
    }
}

/// Owns every message type's queue. `update` must be called once per
/// schedule run to rotate every queue's buffers.
#[derive(Default)]
pub struct MessageBus {
    queues: HashMap<TypeId, Box<dyn ErasedQueue>, RandomState>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send<T: Send + Sync + 'static>(&mut self, message: T) {
        let queue = self
            .queues
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(MessageQueue::<T>::new()));
        queue
            .as_any_mut()
            .downcast_mut::<MessageQueue<T>>()
            .expect("message queue downcast matches its TypeId key")
            .send(message);
    }

    /// Read every message this reader has not yet consumed, advancing its
    /// cursor to the current tail.
    pub fn read<T: Send + Sync + 'static>(&self, reader: &mut MessageReader<T>) -> Vec<&T> {
        let Some(queue) = self.queues.get(&TypeId::of::<T>()) else {
            return Vec::new();
        };
        let queue = queue
            .as_any()
            .downcast_ref::<MessageQueue<T>>()
            .expect("message queue downcast matches its TypeId key");
        let messages = queue.read_since(reader.cursor);
        reader.cursor = queue.tail();
        messages
    }

    /// Read every message this reader has not yet consumed, without moving
    /// its cursor. Calling `read` afterwards still returns these messages.
    pub fn peek<T: Send + Sync + 'static>(&self, reader: &MessageReader<T>) -> Vec<&T> {
        let Some(queue) = self.queues.get(&TypeId::of::<T>()) else {
            return Vec::new();
        };
        let queue = queue
            .as_any()
            .downcast_ref::<MessageQueue<T>>()
            .expect("message queue downcast matches its TypeId key");
        queue.read_since(reader.cursor)
    }

    /// Rotate every type's double buffer. Call once per schedule run.
    pub fn update(&mut self) {
        for queue in self.queues.values_mut() {
            queue.rotate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Hit(u32);

    #[test]
    fn reader_sees_messages_sent_before_and_after_one_rotation() {
        let mut bus = MessageBus::new();
        let mut reader = MessageReader::<Hit>::new();

        bus.send(Hit(1));
        assert_eq!(bus.read(&mut reader), vec![&Hit(1)]);
        assert!(bus.read(&mut reader).is_empty());

        bus.send(Hit(2));
        bus.update();
        bus.send(Hit(3));
        let mut late_reader = MessageReader::<Hit>::new();
        assert_eq!(late_reader.cursor, 0);
        let seen: Vec<&Hit> = bus.read(&mut late_reader);
        assert_eq!(seen, vec![&Hit(1), &Hit(2), &Hit(3)]);
    }

    #[test]
    fn message_dropped_after_two_rotations() {
        let mut bus = MessageBus::new();
        let mut reader = MessageReader::<Hit>::new();
        bus.send(Hit(1));
        bus.update();
        bus.update();
        assert!(bus.read(&mut reader).is_empty());
    }

    #[test]
    fn independent_readers_track_independent_cursors() {
        let mut bus = MessageBus::new();
        bus.send(Hit(1));
        let mut reader_a = MessageReader::<Hit>::new();
        assert_eq!(bus.read(&mut reader_a), vec![&Hit(1)]);

        bus.send(Hit(2));
        let mut reader_b = MessageReader::<Hit>::new();
        assert_eq!(bus.read(&mut reader_b), vec![&Hit(1), &Hit(2)]);
        assert_eq!(bus.read(&mut reader_a), vec![&Hit(2)]);
    }

    #[test]
    fn peek_does_not_advance_the_cursor() {
        let mut bus = MessageBus::new();
        let mut reader = MessageReader::<Hit>::new();
        bus.send(Hit(1));

        assert_eq!(bus.peek(&reader), vec![&Hit(1)]);
        assert_eq!(reader.current_offset(), 0);
        assert_eq!(bus.peek(&reader), vec![&Hit(1)]);
        assert_eq!(bus.read(&mut reader), vec![&Hit(1)]);
        assert!(bus.peek(&reader).is_empty());
    }

    #[test]
    fn reset_to_rewinds_a_reader() {
        let mut bus = MessageBus::new();
        let mut reader = MessageReader::<Hit>::new();
        bus.send(Hit(1));
        bus.send(Hit(2));
        assert_eq!(bus.read(&mut reader), vec![&Hit(1), &Hit(2)]);
        let replay_from = reader.current_offset() - 1;

        reader.reset_to(replay_from);
        assert_eq!(bus.read(&mut reader), vec![&Hit(2)]);
    }
}
