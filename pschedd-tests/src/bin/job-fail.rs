// SPDX-License-Identifier: MIT
// Workload that fails on its own terms, distinct from an exec failure.

use std::process;

fn main() {
    process::exit(3);
}
