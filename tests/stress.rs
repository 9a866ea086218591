use std::mem;
use std::ptr::NonNull;

use challoc::Allocator;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use test_env_log::test;

// The arrays below are length-prefixed i32 arrays written through raw
// pointers, the way a C caller would lay out a flexible array member behind
// the allocator.

fn array_bytes(len: usize) -> usize {
    mem::size_of::<usize>() + mem::size_of::<i32>() * len
}

unsafe fn array_data(ptr: NonNull<u8>) -> *mut i32 {
    ptr.as_ptr().add(mem::size_of::<usize>()).cast()
}

unsafe fn array_len(ptr: NonNull<u8>) -> usize {
    ptr.as_ptr().cast::<usize>().read()
}

unsafe fn allocate_array(alloc: &mut Allocator, fill: i32, len: usize) -> NonNull<u8> {
    let ptr = alloc
        .allocate(array_bytes(len))
        .expect("arena allocation failed");
    ptr.as_ptr().cast::<usize>().write(len);

    let data = array_data(ptr);
    for index in 0..len {
        data.add(index).write(fill);
    }
    ptr
}

/// Resizes the array, refilling every element from the first one, which the
/// reallocation must have preserved.
unsafe fn reallocate_array(alloc: &mut Allocator, ptr: NonNull<u8>, len: usize) -> NonNull<u8> {
    let ptr = alloc
        .reallocate(Some(ptr), array_bytes(len))
        .expect("arena reallocation failed");
    ptr.as_ptr().cast::<usize>().write(len);

    let data = array_data(ptr);
    for index in 1..len {
        data.add(index).write(data.read());
    }
    ptr
}

unsafe fn assert_array_filled_with(ptr: NonNull<u8>, expected: i32) {
    let data = array_data(ptr);
    for index in 0..array_len(ptr) {
        assert_eq!(data.add(index).read(), expected);
    }
}

const ARRAY_COUNT: usize = 4096;
const SIZE_TABLE: [usize; 21] = [
    1, 2, 3, 4, 5, 8, 10, 11, 12, 13, 16, 24, 27, 32, 64, 90, 100, 112, 512, 600, 1024,
];

/// Thousands of arrays churned through a growing arena: every array keeps
/// its own fill value across an arbitrary number of reallocations.
#[test]
fn arena_survives_reallocation_churn() {
    let mut alloc = Allocator::growing(1024 * 1024);
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);

    let mut arrays: Vec<NonNull<u8>> = (0..ARRAY_COUNT)
        .map(|index| unsafe {
            let len = *SIZE_TABLE.choose(&mut rng).unwrap();
            allocate_array(&mut alloc, index as i32, len)
        })
        .collect();

    for round in 0..10_000 {
        let index = round % ARRAY_COUNT;
        let len = *SIZE_TABLE.choose(&mut rng).unwrap();
        arrays[index] = unsafe { reallocate_array(&mut alloc, arrays[index], len) };
    }

    for (index, &ptr) in arrays.iter().enumerate() {
        unsafe { assert_array_filled_with(ptr, index as i32) };
    }

    alloc.destroy();
}

/// Random allocate/free/reallocate traffic through a fixed region chained
/// to a tracked fallback, so blocks constantly cross the strategy boundary.
/// Every live block is tagged with its slot index and verified before it is
/// touched.
#[test]
fn chained_handles_survive_random_traffic() {
    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut alloc = Allocator::fixed_region(4096).with_fallback(Allocator::tracked_system());

    let mut slots: Vec<Option<(NonNull<u8>, usize)>> = vec![None; 64];

    for _ in 0..4096 {
        let index = rng.gen_range(0..slots.len());
        let tag = index as u8;

        match slots[index] {
            None => {
                let size = rng.gen_range(1..=512);
                let ptr = alloc.allocate(size).expect("the chain never fills up");
                unsafe { ptr.as_ptr().write_bytes(tag, size) };
                slots[index] = Some((ptr, size));
            }
            Some((ptr, size)) => unsafe {
                for offset in 0..size {
                    assert_eq!(*ptr.as_ptr().add(offset), tag, "corrupted slot {index}");
                }

                if rng.gen_bool(0.5) {
                    alloc.free(Some(ptr));
                    slots[index] = None;
                } else {
                    let new_size = rng.gen_range(1..=512);
                    let moved = alloc
                        .reallocate(Some(ptr), new_size)
                        .expect("the chain never fills up");
                    // The lesser prefix survived the resize; re-tag the
                    // whole block for the next visit.
                    for offset in 0..new_size.min(size) {
                        assert_eq!(*moved.as_ptr().add(offset), tag);
                    }
                    moved.as_ptr().write_bytes(tag, new_size);
                    slots[index] = Some((moved, new_size));
                }
            },
        }
    }

    for slot in slots.iter().flatten() {
        unsafe { alloc.free(Some(slot.0)) };
    }
    alloc.destroy();
}
