// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Random byte generation for identifiers.

use rand::RngCore;

/// Fill `buf` with random bytes from the thread-local generator.
pub fn fill_random(buf: &mut [u8]) {
    rand::thread_rng().fill_bytes(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_random_differs() {
        let mut a = [0u8; 28];
        let mut b = [0u8; 28];
        fill_random(&mut a);
        fill_random(&mut b);
        assert_ne!(a, b);
    }
}
