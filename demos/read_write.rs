use std::{
    io::{Read, Write},
    thread,
    time::Duration,
};

use synchmess::{
    device::{Device, GroupHandle},
    protocol::{self, InstallGroup, RevokeDelayedMessages, SetSendDelay},
};

// Long enough that nothing arrives on its own while the demo runs.
const SEND_DELAY: Duration = Duration::from_millis(120_000);

fn write_both(handle: &mut GroupHandle) {
    let written = handle.write(b"First write").unwrap();
    println!("written {written} bytes from first write");
    let written = handle.write(b"Second write").unwrap();
    println!("written {written} bytes from second write");
}

fn read_three(handle: &mut GroupHandle) {
    for attempt in ["First", "Second", "Third"] {
        let mut buf = [0; 50];
        match handle.read(&mut buf).unwrap() {
            0 => println!("{attempt} read: message not found"),
            len => println!("{attempt} read: {}", String::from_utf8_lossy(&buf[..len])),
        }
    }
}

fn main() {
    use tracing_subscriber::layer::SubscriberExt;
    let subscriber =
        tracing_subscriber::Registry::default().with(tracing_subscriber::fmt::Layer::default());
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut args = std::env::args();
    let _ = args.next().unwrap();
    let name = args.next().unwrap_or_else(|| "1".to_owned());

    let device = Device::new();
    let installed = device
        .install_group(&InstallGroup::new(&name).unwrap())
        .unwrap();
    println!("group path {}", installed.path);

    let mut handle = device.open(installed.id).unwrap();

    println!("\n:::write and read without delay:::");
    thread::scope(|s| {
        s.spawn(|| write_both(&mut device.open(installed.id).unwrap()));
    });
    read_three(&mut handle);

    println!("\n:::set send delay to {SEND_DELAY:?}, then write and read:::");
    let delay = SetSendDelay::new(SEND_DELAY);
    let (code, body) = protocol::encode(&delay);
    handle.control(code, body).unwrap();
    write_both(&mut handle);
    read_three(&mut handle);

    println!("\n:::revoke delayed messages and read:::");
    let revoke_delayed_messages = RevokeDelayedMessages {};
    let (code, body) = protocol::encode(&revoke_delayed_messages);
    handle.control(code, body).unwrap();
    read_three(&mut handle);

    println!("\n:::write again, close to flush, reopen and read:::");
    write_both(&mut handle);
    drop(handle);

    let mut handle = device.open(installed.id).unwrap();
    read_three(&mut handle);
}
