// SPDX-FileCopyrightText: The usbmidi-bridge authors
// SPDX-License-Identifier: MPL-2.0

use std::{
    io::{stdin, stdout, Write as _},
    sync::Arc,
};

use usbmidi_bridge::{usb::nusb::NusbHost, Config, Event, TerminationCause, UsbMidiBridge};

fn handle_event(event: Event) {
    match event {
        Event::DeviceListChanged(devices) => {
            println!("Device list changed: {num_devices} device(s)", num_devices = devices.len());
        }
        Event::MessageReceived { device_id, message } => {
            println!("{device_id}: {message}");
        }
        Event::ListeningTerminated { device_id, cause } => match cause {
            TerminationCause::Stopped => println!("{device_id}: stopped listening"),
            TerminationCause::ConnectionLost => println!("{device_id}: connection lost"),
        },
    }
}

fn main() {
    pretty_env_logger::init();
    match run() {
        Ok(()) => (),
        Err(err) => println!("Error: {err}"),
    }
}

fn run() -> anyhow::Result<()> {
    let mut bridge = UsbMidiBridge::new(NusbHost::new(), Config::default(), Arc::new(handle_event));
    let mut devices = bridge.enumerate()?;
    let device = match devices.len() {
        0 => anyhow::bail!("no device found"),
        1 => {
            println!(
                "Choosing the only available device: {name}",
                name = devices[0].name
            );
            devices.remove(0)
        }
        _ => {
            println!("\nAvailable devices:");
            for (i, device) in devices.iter().enumerate() {
                println!(
                    "{i}: {name} ({vendor_id:04X}:{product_id:04X})",
                    name = device.name,
                    vendor_id = device.vendor_id,
                    product_id = device.product_id,
                );
            }
            print!("Please select a device: ");
            stdout().flush()?;
            let mut input = String::new();
            stdin().read_line(&mut input)?;
            devices.remove(input.trim().parse::<usize>()?)
        }
    };

    if !bridge.start_listening(device.id) {
        println!("{name}: listening is not available", name = device.name);
    }

    println!("Enter MIDI messages as hex pairs, e.g. \"90 3C 64\", or an empty line to exit...");
    println!("Enter \"scan\" after attaching or detaching a device.");
    for line in stdin().lines() {
        let line = line?;
        match line.trim() {
            "" => break,
            "scan" => {
                // No hotplug events are observed, devices are rescanned on request
                bridge.handle_device_list_change();
                continue;
            }
            _ => (),
        }
        if let Err(err) = bridge.send(device.id, &line) {
            println!("{code}: {err}", code = err.code());
        }
    }

    bridge.stop_listening();
    Ok(())
}
