// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Identifier codec.
//!
//! Every ID is a fixed-size byte array. Task and object IDs are derived
//! deterministically from their parents so that re-executing a task during
//! reconstruction produces the exact same object IDs again.
//!
//! Layout:
//! - `JobID` (4 bytes)
//! - `ActorID` (16 bytes = 12 unique + 4 JobID)
//! - `TaskID` (24 bytes = 8 unique + 16 ActorID)
//! - `ObjectID` (30 bytes = 4 index + 2 flags + 24 TaskID)
//! - `NodeID` / `WorkerID` (28 bytes, random)
//!
//! Object IDs embed their (task, index) pair verbatim, so two distinct pairs
//! can never produce the same ObjectID.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::constants::UNIQUE_ID_SIZE;
use crate::status::{RayError, RayResult};

// MurmurHash64A, used both for hashing IDs into maps and for deriving the
// unique bytes of child task IDs.
fn murmur_hash_64a(key: &[u8], seed: u64) -> u64 {
    const M: u64 = 0xc6a4a7935bd1e995;
    const R: u32 = 47;

    let mut h: u64 = seed ^ (key.len() as u64).wrapping_mul(M);

    let mut chunks = key.chunks_exact(8);
    for chunk in &mut chunks {
        let mut block = [0u8; 8];
        block.copy_from_slice(chunk);
        let mut k = u64::from_le_bytes(block);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        for (i, byte) in tail.iter().enumerate().rev() {
            h ^= (*byte as u64) << (8 * i);
        }
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

/// Generates a fixed-size ID newtype.
///
/// Nil is all `0xFF` bytes. Parsing from bytes or hex validates the length
/// (and, for types that pass a validator, the content) and fails with
/// `InvalidIdentifier`.
macro_rules! define_id {
    ($name:ident, $size:expr) => {
        define_id!($name, $size, |_data: &[u8; $size]| -> RayResult<()> { Ok(()) });
    };
    ($name:ident, $size:expr, $validate:expr) => {
        #[derive(Clone, Copy)]
        pub struct $name {
            data: [u8; $size],
        }

        impl $name {
            pub const SIZE: usize = $size;

            pub const fn nil() -> Self {
                Self { data: [0xFF; $size] }
            }

            /// Parse an ID from raw bytes.
            pub fn from_binary(bytes: &[u8]) -> RayResult<Self> {
                let data: [u8; $size] = bytes.try_into().map_err(|_| {
                    RayError::invalid_identifier(format!(
                        "expected {} bytes for {}, got {}",
                        $size,
                        stringify!($name),
                        bytes.len()
                    ))
                })?;
                let validate = $validate;
                validate(&data)?;
                Ok(Self { data })
            }

            /// Parse an ID from a lowercase or uppercase hex string.
            pub fn from_hex(hex_str: &str) -> RayResult<Self> {
                if hex_str.len() != $size * 2 {
                    return Err(RayError::invalid_identifier(format!(
                        "expected {} hex chars for {}, got {}",
                        $size * 2,
                        stringify!($name),
                        hex_str.len()
                    )));
                }
                let bytes = hex::decode(hex_str).map_err(|e| {
                    RayError::invalid_identifier(format!("bad hex for {}: {e}", stringify!($name)))
                })?;
                Self::from_binary(&bytes)
            }

            pub fn from_random() -> Self {
                let mut data = [0u8; $size];
                raylite_util::random::fill_random(&mut data);
                Self { data }
            }

            pub fn is_nil(&self) -> bool {
                self.data == [0xFF; $size]
            }

            pub fn data(&self) -> &[u8; $size] {
                &self.data
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.data
            }

            pub fn binary(&self) -> Vec<u8> {
                self.data.to_vec()
            }

            pub fn hex(&self) -> String {
                hex::encode(self.data)
            }

            pub fn murmur_hash(&self) -> u64 {
                murmur_hash_64a(&self.data, 0)
            }

            /// First 8 hex characters, for compact log lines.
            pub fn short_hex(&self) -> String {
                hex::encode(&self.data[..4])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::nil()
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.data == other.data
            }
        }

        impl Eq for $name {}

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.data.cmp(&other.data)
            }
        }

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.murmur_hash().hash(state);
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.hex())
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.data
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.hex())
            }
        }
    };
}

define_id!(JobID, 4);
define_id!(ActorID, 16);
define_id!(TaskID, 24);
define_id!(ObjectID, 30, validate_object_id);
define_id!(NodeID, UNIQUE_ID_SIZE);
define_id!(WorkerID, UNIQUE_ID_SIZE);

impl JobID {
    pub fn from_int(value: u32) -> Self {
        Self {
            data: value.to_be_bytes(),
        }
    }

    pub fn to_int(&self) -> u32 {
        u32::from_be_bytes(self.data)
    }
}

impl ActorID {
    const UNIQUE_BYTES_LENGTH: usize = 12;

    /// Derive the ID of the actor created by the `counter`-th submission of
    /// `parent_task_id`.
    pub fn of(job_id: &JobID, parent_task_id: &TaskID, counter: u64) -> Self {
        let mut input = Vec::with_capacity(TaskID::SIZE + 8);
        input.extend_from_slice(parent_task_id.as_bytes());
        input.extend_from_slice(&counter.to_le_bytes());

        let first = murmur_hash_64a(&input, 0).to_le_bytes();
        let second = murmur_hash_64a(&input, 1).to_le_bytes();

        let mut data = [0u8; 16];
        data[..8].copy_from_slice(&first);
        data[8..Self::UNIQUE_BYTES_LENGTH].copy_from_slice(&second[..4]);
        data[Self::UNIQUE_BYTES_LENGTH..].copy_from_slice(job_id.data());
        Self { data }
    }

    pub fn job_id(&self) -> JobID {
        let mut data = [0u8; 4];
        data.copy_from_slice(&self.data[Self::UNIQUE_BYTES_LENGTH..]);
        JobID { data }
    }
}

impl TaskID {
    const UNIQUE_BYTES_LENGTH: usize = 8;

    /// The root task of a driver. Every task the driver submits descends
    /// from it.
    pub fn for_driver_task(job_id: &JobID) -> Self {
        let actor_id = ActorID::of(job_id, &TaskID::nil(), 0);
        Self::for_actor_creation_task(&actor_id)
    }

    pub fn for_actor_creation_task(actor_id: &ActorID) -> Self {
        let mut data = [0u8; 24];
        data[Self::UNIQUE_BYTES_LENGTH..].copy_from_slice(actor_id.data());
        Self { data }
    }

    /// Derive the `counter`-th child of `parent_task_id`.
    ///
    /// Actor method calls embed the actor ID; normal tasks embed the nil
    /// actor.
    pub fn derive(parent_task_id: &TaskID, counter: u64, actor_id: Option<&ActorID>) -> RayResult<Self> {
        if parent_task_id.is_nil() {
            return Err(RayError::invalid_identifier(
                "cannot derive a task id from a nil parent",
            ));
        }
        let actor_id = actor_id.copied().unwrap_or_else(ActorID::nil);

        let mut input = Vec::with_capacity(TaskID::SIZE + 8 + ActorID::SIZE);
        input.extend_from_slice(parent_task_id.as_bytes());
        input.extend_from_slice(&counter.to_le_bytes());
        input.extend_from_slice(actor_id.as_bytes());
        let mut hash = murmur_hash_64a(&input, 0);
        // All-zero unique bytes mark actor creation tasks.
        if hash == 0 {
            hash = murmur_hash_64a(&input, 1) | 1;
        }

        let mut data = [0u8; 24];
        data[..Self::UNIQUE_BYTES_LENGTH].copy_from_slice(&hash.to_le_bytes());
        data[Self::UNIQUE_BYTES_LENGTH..].copy_from_slice(actor_id.data());
        Ok(Self { data })
    }

    pub fn actor_id(&self) -> ActorID {
        let mut data = [0u8; 16];
        data.copy_from_slice(&self.data[Self::UNIQUE_BYTES_LENGTH..]);
        ActorID { data }
    }

    pub fn job_id(&self) -> JobID {
        self.actor_id().job_id()
    }

    pub fn is_for_actor_creation_task(&self) -> bool {
        self.data[..Self::UNIQUE_BYTES_LENGTH].iter().all(|&b| b == 0)
    }
}

/// How an object came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ObjectType {
    /// Created by an explicit `put`.
    Put,
    /// The Nth return value of a task.
    Return,
    /// A signal sent by a task or actor.
    Signal,
}

impl ObjectType {
    fn to_bits(self) -> u16 {
        match self {
            ObjectType::Put => 0,
            ObjectType::Return => 1,
            ObjectType::Signal => 2,
        }
    }

    fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            0 => Some(ObjectType::Put),
            1 => Some(ObjectType::Return),
            2 => Some(ObjectType::Signal),
            _ => None,
        }
    }
}

const INDEX_BYTES_LENGTH: usize = 4;
const FLAGS_BYTES_LENGTH: usize = 2;
const CREATED_BY_TASK_BIT: u16 = 1 << 15;
const OBJECT_TYPE_SHIFT: u16 = 13;
const OBJECT_TYPE_MASK: u16 = 0b11 << OBJECT_TYPE_SHIFT;
const KNOWN_FLAG_BITS: u16 = CREATED_BY_TASK_BIT | OBJECT_TYPE_MASK;

fn validate_object_id(data: &[u8; 30]) -> RayResult<()> {
    if data.iter().all(|&b| b == 0xFF) {
        return Ok(());
    }
    let flags = u16::from_be_bytes([data[INDEX_BYTES_LENGTH], data[INDEX_BYTES_LENGTH + 1]]);
    if flags & !KNOWN_FLAG_BITS != 0 || flags & CREATED_BY_TASK_BIT == 0 {
        return Err(RayError::invalid_identifier(format!(
            "object id carries unknown flags {flags:#06x}"
        )));
    }
    if ObjectType::from_bits((flags & OBJECT_TYPE_MASK) >> OBJECT_TYPE_SHIFT).is_none() {
        return Err(RayError::invalid_identifier("object id carries an unknown object type"));
    }
    Ok(())
}

impl ObjectID {
    /// Largest index a task may use for returns or puts.
    pub const MAX_OBJECT_INDEX: u32 = u32::MAX;

    fn compose(task_id: &TaskID, index: u32, object_type: ObjectType) -> RayResult<Self> {
        if task_id.is_nil() {
            return Err(RayError::invalid_identifier("object id needs a non-nil task id"));
        }
        if index == 0 {
            return Err(RayError::invalid_identifier("object indices start at 1"));
        }
        let flags = CREATED_BY_TASK_BIT | (object_type.to_bits() << OBJECT_TYPE_SHIFT);
        let mut data = [0u8; 30];
        data[..INDEX_BYTES_LENGTH].copy_from_slice(&index.to_be_bytes());
        data[INDEX_BYTES_LENGTH..INDEX_BYTES_LENGTH + FLAGS_BYTES_LENGTH]
            .copy_from_slice(&flags.to_be_bytes());
        data[INDEX_BYTES_LENGTH + FLAGS_BYTES_LENGTH..].copy_from_slice(task_id.data());
        Ok(Self { data })
    }

    /// The `index`-th object `put` by `task_id` (1-based).
    pub fn for_put(task_id: &TaskID, index: u32) -> RayResult<Self> {
        Self::compose(task_id, index, ObjectType::Put)
    }

    /// The `index`-th return value of `task_id` (1-based).
    pub fn for_task_return(task_id: &TaskID, index: u32) -> RayResult<Self> {
        Self::compose(task_id, index, ObjectType::Return)
    }

    /// The `counter`-th signal emitted by `task_id`.
    pub fn for_signal(task_id: &TaskID, counter: u32) -> RayResult<Self> {
        Self::compose(task_id, counter, ObjectType::Signal)
    }

    /// The object that becomes available once an actor's constructor ran.
    pub fn for_actor_handle(actor_id: &ActorID) -> Self {
        let task_id = TaskID::for_actor_creation_task(actor_id);
        let flags = CREATED_BY_TASK_BIT | (ObjectType::Return.to_bits() << OBJECT_TYPE_SHIFT);
        let mut data = [0u8; 30];
        data[..INDEX_BYTES_LENGTH].copy_from_slice(&1u32.to_be_bytes());
        data[INDEX_BYTES_LENGTH..INDEX_BYTES_LENGTH + FLAGS_BYTES_LENGTH]
            .copy_from_slice(&flags.to_be_bytes());
        data[INDEX_BYTES_LENGTH + FLAGS_BYTES_LENGTH..].copy_from_slice(task_id.data());
        Self { data }
    }

    pub fn object_index(&self) -> u32 {
        let mut index = [0u8; INDEX_BYTES_LENGTH];
        index.copy_from_slice(&self.data[..INDEX_BYTES_LENGTH]);
        u32::from_be_bytes(index)
    }

    fn flags(&self) -> u16 {
        u16::from_be_bytes([self.data[INDEX_BYTES_LENGTH], self.data[INDEX_BYTES_LENGTH + 1]])
    }

    /// Kind of object; `None` for the nil ID.
    pub fn object_type(&self) -> Option<ObjectType> {
        if self.is_nil() {
            return None;
        }
        ObjectType::from_bits((self.flags() & OBJECT_TYPE_MASK) >> OBJECT_TYPE_SHIFT)
    }

    pub fn is_put(&self) -> bool {
        self.object_type() == Some(ObjectType::Put)
    }

    pub fn is_task_return(&self) -> bool {
        self.object_type() == Some(ObjectType::Return)
    }

    /// The task that created this object.
    pub fn task_id(&self) -> TaskID {
        let mut data = [0u8; 24];
        data.copy_from_slice(&self.data[INDEX_BYTES_LENGTH + FLAGS_BYTES_LENGTH..]);
        TaskID { data }
    }

    pub fn is_actor_handle(&self) -> bool {
        self.is_task_return() && self.object_index() == 1 && self.task_id().is_for_actor_creation_task()
    }
}

/// Derive a child task ID. See [`TaskID::derive`].
pub fn derive_task_id(parent_task_id: &TaskID, counter: u64, actor_id: Option<&ActorID>) -> RayResult<TaskID> {
    TaskID::derive(parent_task_id, counter, actor_id)
}

/// Derive an object ID of the given flavor from `(task_id, index)`.
pub fn derive_object_id(task_id: &TaskID, index: u32, object_type: ObjectType) -> RayResult<ObjectID> {
    ObjectID::compose(task_id, index, object_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;
    use std::collections::HashSet;

    fn driver_task() -> TaskID {
        TaskID::for_driver_task(&JobID::from_int(7))
    }

    #[test]
    fn test_nil_ids() {
        assert!(ObjectID::nil().is_nil());
        assert!(TaskID::default().is_nil());
        assert_eq!(ObjectID::nil().object_type(), None);
        assert!(!NodeID::from_random().is_nil());
    }

    #[test]
    fn test_object_id_embeds_task_and_index() {
        let task = driver_task();
        let put = ObjectID::for_put(&task, 3).unwrap();
        let ret = ObjectID::for_task_return(&task, 3).unwrap();
        assert_ne!(put, ret);
        assert_eq!(put.task_id(), task);
        assert_eq!(ret.object_index(), 3);
        assert!(put.is_put());
        assert!(ret.is_task_return());
        assert_eq!(ObjectID::for_signal(&task, 10000).unwrap().object_type(), Some(ObjectType::Signal));
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let parent = driver_task();
        let a = TaskID::derive(&parent, 5, None).unwrap();
        let b = TaskID::derive(&parent, 5, None).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            derive_object_id(&a, 1, ObjectType::Return).unwrap(),
            ObjectID::for_task_return(&b, 1).unwrap()
        );
    }

    #[test]
    fn test_sibling_tasks_and_objects_do_not_collide() {
        let parent = driver_task();
        let mut tasks = HashSet::new();
        let mut objects = HashSet::new();
        for counter in 1..=2000u64 {
            let task = derive_task_id(&parent, counter, None).unwrap();
            assert!(!task.is_for_actor_creation_task());
            assert!(tasks.insert(task));
            for index in 1..=3 {
                assert!(objects.insert(ObjectID::for_task_return(&task, index).unwrap()));
            }
        }
    }

    #[test]
    fn test_actor_tasks_embed_actor() {
        let job = JobID::from_int(1);
        let parent = TaskID::for_driver_task(&job);
        let actor = ActorID::of(&job, &parent, 1);
        assert_eq!(actor.job_id(), job);
        let method = TaskID::derive(&parent, 2, Some(&actor)).unwrap();
        assert_eq!(method.actor_id(), actor);
        assert_eq!(method.job_id(), job);

        let handle = ObjectID::for_actor_handle(&actor);
        assert!(handle.is_actor_handle());
        assert!(!ObjectID::for_task_return(&method, 1).unwrap().is_actor_handle());
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        let err = ObjectID::from_binary(&[0u8; 5]).unwrap_err();
        assert_eq!(err.code, StatusCode::InvalidIdentifier);

        let err = TaskID::from_hex("zz").unwrap_err();
        assert_eq!(err.code, StatusCode::InvalidIdentifier);

        let err = ObjectID::for_put(&TaskID::nil(), 1).unwrap_err();
        assert_eq!(err.code, StatusCode::InvalidIdentifier);
        assert!(ObjectID::for_task_return(&driver_task(), 0).is_err());
        assert!(TaskID::derive(&TaskID::nil(), 1, None).is_err());

        // Flags without the created-by-task bit.
        let mut raw = ObjectID::for_put(&driver_task(), 1).unwrap().binary();
        raw[4] = 0;
        raw[5] = 0;
        assert!(ObjectID::from_binary(&raw).is_err());
    }

    #[test]
    fn test_hex_roundtrip_preserves_flavor() {
        let id = ObjectID::for_task_return(&driver_task(), 2).unwrap();
        let parsed = ObjectID::from_hex(&id.hex()).unwrap();
        assert_eq!(parsed, id);
        assert!(parsed.is_task_return());
        assert_eq!(ObjectID::from_binary(&ObjectID::nil().binary()).unwrap(), ObjectID::nil());
    }

    #[test]
    fn test_murmur_hash_tail_bytes() {
        // Inputs that differ only in the tail must hash differently.
        assert_ne!(murmur_hash_64a(b"abcdefghi", 0), murmur_hash_64a(b"abcdefghj", 0));
        assert_ne!(murmur_hash_64a(b"", 0), murmur_hash_64a(b"", 1));
    }
}
