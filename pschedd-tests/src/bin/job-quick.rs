// SPDX-License-Identifier: MIT
// Workload that finishes well inside one time slice.

use std::thread;
use std::time::Duration;

fn main() {
    thread::sleep(Duration::from_millis(10));
}
