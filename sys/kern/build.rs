// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use serde::Deserialize;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let kconfig: KernelConfig = match env::var("KERNEL_CONFIG") {
        Ok(text) => ron::de::from_str(&text)?,
        Err(env::VarError::NotPresent) => KernelConfig::default(),
        Err(e) => return Err(e.into()),
    };
    println!("cargo:rerun-if-env-changed=KERNEL_CONFIG");

    kconfig.check()?;

    let out = &PathBuf::from(env::var_os("OUT_DIR").ok_or("no OUT_DIR")?);
    let mut file = File::create(out.join("kconfig.rs"))?;

    writeln!(file, "// See build.rs for details")?;
    writeln!(
        file,
        "pub const PHYS_MEM_BYTES: usize = {:#x};",
        kconfig.phys_mem_bytes
    )?;
    writeln!(
        file,
        "pub const MAX_PROCESSES: usize = {};",
        kconfig.max_processes
    )?;
    writeln!(
        file,
        "pub const MAX_OPEN_FILES: usize = {};",
        kconfig.max_open_files
    )?;
    writeln!(file, "pub const TICK_HZ: u32 = {};", kconfig.tick_hz)?;

    Ok(())
}

/// Kernel shape, fixed at compile time.
///
/// Supplied as RON in `KERNEL_CONFIG`, e.g.
/// `(phys_mem_bytes: 0x2000000, max_processes: 8)`. Omitted fields keep their
/// defaults.
#[derive(Deserialize)]
#[serde(default)]
struct KernelConfig {
    phys_mem_bytes: u32,
    max_processes: usize,
    max_open_files: usize,
    tick_hz: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            phys_mem_bytes: 100 << 20,
            max_processes: 16,
            max_open_files: 16,
            tick_hz: 100,
        }
    }
}

impl KernelConfig {
    fn check(&self) -> Result<(), String> {
        if self.phys_mem_bytes % 4096 != 0 {
            return Err(format!(
                "phys_mem_bytes {:#x} is not a whole number of pages",
                self.phys_mem_bytes
            ));
        }
        // The identity map has to stay clear of the user half.
        if self.phys_mem_bytes > 0x4000_0000 {
            return Err("phys_mem_bytes overlaps user space".to_string());
        }
        // Slot 0 is reserved, so one process needs two slots.
        if self.max_processes < 2 {
            return Err("max_processes must be at least 2".to_string());
        }
        // Descriptors 0-2 are the console.
        if self.max_open_files < 3 {
            return Err("max_open_files must be at least 3".to_string());
        }
        if self.tick_hz == 0 || 1000 % self.tick_hz != 0 {
            return Err(format!("tick_hz {} must divide 1000", self.tick_hz));
        }
        Ok(())
    }
}
