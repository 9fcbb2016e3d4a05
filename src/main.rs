// dialOS: cooperative applet runtime for a round rotary display.
//
// Copyright (C) 2023  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

// Desktop host: load a launcher config, install the listed applets
// into the RAM FS, and drive the scheduler off the wall clock.

use std::{
    env::args,
    fs,
    fs::File,
    thread,
    time::Duration,
};

use ron::de::from_reader;
use serde::Deserialize;

use dialos::{
    clock::Clock,
    manager::{AppletEntry, AppletManager},
    platform::ConsolePlatform,
    scheduler::{AppletDescriptor, Scheduler},
};

#[derive(Deserialize, Debug)]
struct LauncherApplet {
    name: String,
    path: String,
    #[serde(default)]
    repeat: bool,
    #[serde(default)]
    execute_interval_ms: u32,
    #[serde(default)]
    autostart: bool,
}

#[derive(Deserialize, Debug)]
struct LauncherConfig {
    tick_ms: u64,
    applets: Vec<LauncherApplet>,
}

fn load(path: String) -> LauncherConfig {
    let reader = File::open(path).expect("couldn't open launcher config");
    from_reader(reader).expect("couldn't parse launcher config")
}

fn main() {
    let config = load(args().nth(1).expect("usage: dialos <config.ron>"));

    let mut entries = Vec::new();
    let mut autostart = Vec::new();
    for (index, applet) in config.applets.iter().enumerate() {
        let blob = fs::read(&applet.path)
            .expect(&format!("couldn't read {}", applet.path));
        entries.push(AppletEntry {
            descriptor: AppletDescriptor {
                name: applet.name.clone(),
                repeat: applet.repeat,
                execute_interval_ms: applet.execute_interval_ms,
            },
            blob,
        });
        if applet.autostart {
            autostart.push(index);
        }
    }

    let mut platform = ConsolePlatform::new();
    let mut scheduler = Scheduler::new();
    let mut manager = AppletManager::new(entries);

    for index in autostart {
        if let Err(e) = manager.install(&mut platform, index) {
            eprintln!("install failed: {:?}", e);
            continue;
        }
        if let Err(e) = manager.launch(&mut platform, &mut scheduler, index) {
            eprintln!("launch failed: {:?}", e);
        }
    }
    manager.render(&mut platform);

    let clock = Clock::new();
    loop {
        platform.set_now(clock.millis());
        scheduler.tick(&mut platform);
        thread::sleep(Duration::from_millis(config.tick_ms));
    }
}
