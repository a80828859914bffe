//! Minimal target for exercising injection end to end: calls `F(i)` in a
//! loop and prints what the function body observed. After injecting the
//! demo patch module, every call reports 1337 regardless of input.

use std::{process, thread, time::Duration};

#[no_mangle]
#[inline(never)]
#[allow(non_snake_case)]
pub extern "C" fn F(i: i32) -> i32 {
    i
}

fn main() {
    println!("demo-target pid {}", process::id());
    let mut i = 0;
    loop {
        println!("F({}) = {}", i, F(i));
        i += 1;
        thread::sleep(Duration::from_secs(1));
    }
}
