// SPDX-License-Identifier: MIT
// Workload that outlives the usual test time slice.

use std::thread;
use std::time::Duration;

fn main() {
    thread::sleep(Duration::from_millis(200));
}
