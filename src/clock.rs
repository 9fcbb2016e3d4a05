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

use std::time::Instant;

// Wrapper around somewhat obnoxious system time api. The host loop
// reads this once per tick and feeds it to the platform; nothing else
// looks at the wall clock.
pub struct Clock {
    instant: Instant,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            instant: Instant::now(),
        }
    }

    // Milliseconds since the clock was created.
    pub fn millis(&self) -> u64 {
        let e = self.instant.elapsed();
        e.as_secs() * 1000 + e.subsec_millis() as u64
    }
}
