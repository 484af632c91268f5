// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Discovery of USB serial adapters through sysfs.

use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
};

use log::debug;
use regex::Regex;

/// Where the kernel lists USB devices.
pub const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

const USB_SERIAL_PRODUCT: &str = "(?i)usb.*serial|serial.*usb";

/// Sorted entries of `dir` whose file name satisfies `filter`.
fn entries(dir: &Path, filter: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<_> = read_dir
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_str().is_some_and(&filter))
        .map(|entry| entry.path())
        .collect();
    paths.sort();
    paths
}

/// The first `*:*/tty*` entry below a USB device.
fn first_tty(device: &Path) -> Option<String> {
    entries(device, |name| name.contains(':'))
        .iter()
        .flat_map(|interface| entries(interface, |name| name.starts_with("tty")))
        .find_map(|tty| tty.file_name()?.to_str().map(ToOwned::to_owned))
}

/// Names of the tty devices of all USB serial adapters below `root`.
///
/// Every `usb*/*/product` file whose content looks like a USB serial
/// product contributes the first tty of that device.
pub fn find_usb_serial_devices(root: impl AsRef<Path>) -> io::Result<BTreeSet<String>> {
    let product_re = Regex::new(USB_SERIAL_PRODUCT).map_err(io::Error::other)?;
    let root = root.as_ref();
    // Fail on a missing root, everything below is optional.
    fs::read_dir(root)?;

    let mut found = BTreeSet::new();
    for bus in entries(root, |name| name.starts_with("usb")) {
        for device in entries(&bus, |_| true) {
            let Ok(product) = fs::read_to_string(device.join("product")) else {
                continue;
            };
            let product = product.trim_end_matches('\n');
            if !product_re.is_match(product) {
                continue;
            }
            if let Some(tty) = first_tty(&device) {
                debug!("Found {product} as {tty}");
                found.insert(tty);
            }
        }
    }
    Ok(found)
}
