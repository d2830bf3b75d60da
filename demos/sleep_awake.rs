use std::{thread, time::Duration};

use synchmess::{
    device::Device,
    protocol::{self, AwakeBarrier, InstallGroup, SleepOnBarrier},
};

fn main() {
    use tracing_subscriber::layer::SubscriberExt;
    let subscriber =
        tracing_subscriber::Registry::default().with(tracing_subscriber::fmt::Layer::default());
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut args = std::env::args();
    let _ = args.next().unwrap();
    let sleepers: usize = args.next().map(|s| s.parse().unwrap()).unwrap_or(2);

    let device = Device::new();
    let installed = device
        .install_group(&InstallGroup::new("first").unwrap())
        .unwrap();
    println!("{}", installed.path);

    let handle = device.open(installed.id).unwrap();

    thread::scope(|s| {
        for i in 0..sleepers {
            let sleeper = device.open(installed.id).unwrap();
            s.spawn(move || {
                println!("sleep on barrier, thread num={i}");
                let sleep_on_barrier = SleepOnBarrier {};
                let (code, body) = protocol::encode(&sleep_on_barrier);
                sleeper.control(code, body).unwrap();
                println!("after thread awake, thread num={i}");
            });
        }

        while handle.group().sleepers() < sleepers {
            thread::sleep(Duration::from_millis(10));
        }

        println!("before awake barrier, in main");
        let awake_barrier = AwakeBarrier {};
        let (code, body) = protocol::encode(&awake_barrier);
        let reply = handle.control(code, body).unwrap();
        println!("{reply:?}");
    });
}
