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

// The cooperative scheduler.
//
// Single-threaded, round-robin, one execute() slice per Running task
// per tick. Tasks suspend themselves (sleep, yield), finish, or fault;
// the scheduler owns every transition between those states and is the
// only component that looks at the clock. Terminating a task drops its
// VM and with it the applet's whole pool, so eviction can never leak or
// fail halfway.

use serde::{Deserialize, Serialize};

use crate::platform::Platform;
use crate::vm::{VM, VMResult};


// Instructions per task per tick.
pub const DEFAULT_BUDGET: u32 = 1000;

// How long a faulted repeating applet stays down before its reset.
const ERROR_BACKOFF_MS: u64 = 5000;


#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppletDescriptor {
    pub name: String,
    #[serde(default)]
    pub repeat: bool,
    #[serde(default)]
    pub execute_interval_ms: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TaskState {
    Running,
    Sleeping(u64),
    // one-shot applet ran to completion; parked, still serving callbacks
    Finished,
    // one-shot applet faulted; parked for good
    Error(String),
}

pub struct Task {
    pub vm: VM,
    pub descriptor: AppletDescriptor,
    pub state: TaskState,
    pub exec_count: u32,
    pub paused: bool,
    announced: bool,
}

impl Task {
    fn new(vm: VM, descriptor: AppletDescriptor) -> Task {
        Task {
            vm,
            descriptor,
            state: TaskState::Running,
            exec_count: 0,
            paused: false,
            announced: false,
        }
    }

    // app.onLoad fires once, after the top-level code has had its say.
    fn announce(&mut self) {
        if !self.announced {
            self.announced = true;
            if self.vm.has_callback("app.onLoad") {
                self.vm.enqueue_event("app.onLoad", Vec::new());
            }
        }
    }
}


pub struct Scheduler {
    tasks: Vec<Task>,
    budget: u32,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler::with_budget(DEFAULT_BUDGET)
    }

    pub fn with_budget(budget: u32) -> Scheduler {
        Scheduler { tasks: Vec::new(), budget }
    }

    pub fn spawn(&mut self, vm: VM, descriptor: AppletDescriptor) {
        trace!("spawn {}", descriptor.name);
        self.tasks.push(Task::new(vm, descriptor));
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.descriptor.name == name)
    }

    pub fn task_mut(&mut self, name: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.descriptor.name == name)
    }

    // Dropping the task drops its VM and pool; the applet's entire
    // budget comes back at once.
    pub fn terminate(&mut self, name: &str) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|t| t.descriptor.name != name);
        self.tasks.len() != before
    }

    // A paused task keeps its heap and its place; it just stops
    // receiving slices until resumed.
    pub fn set_paused(&mut self, name: &str, paused: bool) -> bool {
        match self.task_mut(name) {
            Some(task) => {
                task.paused = paused;
                true
            },
            None => false
        }
    }

    // Buffered platform events drain FIFO into the queue of every task
    // with a matching registered callback.
    fn route_events(&mut self, platform: &mut impl Platform) {
        while let Some(event) = platform.poll_event() {
            trace!("event {}", event.name);
            for task in self.tasks.iter_mut() {
                if task.vm.has_callback(&event.name) {
                    task.vm.enqueue_event(&event.name, event.args.clone());
                }
            }
        }
    }

    pub fn tick(&mut self, platform: &mut impl Platform) {
        self.route_events(platform);
        let now = platform.now_ms();
        let budget = self.budget;

        for task in self.tasks.iter_mut() {
            if task.paused {
                continue;
            }
            if let TaskState::Sleeping(wake) = task.state {
                if now >= wake {
                    task.state = TaskState::Running;
                } else {
                    continue;
                }
            }

            // parked tasks get a slice only to serve queued callbacks
            let parked = match task.state {
                TaskState::Running => false,
                TaskState::Finished if task.vm.has_pending_callbacks() => true,
                _ => continue,
            };

            let result = task.vm.execute(budget, platform);
            task.exec_count += 1;

            if parked {
                // a callback on a parked task must not revive it
                match result {
                    VMResult::Error(msg) =>
                        platform.report(&task.descriptor.name, &msg),
                    VMResult::OutOfMemory =>
                        platform.report(&task.descriptor.name, "out of memory"),
                    _ => ()
                }
                continue;
            }

            match result {
                VMResult::Ok => (),
                VMResult::Yield => {
                    task.announce();
                    if let Some(ms) = task.vm.take_sleep_request() {
                        task.state = TaskState::Sleeping(now + ms as u64);
                    }
                },
                VMResult::Finished => {
                    task.announce();
                    let interval = task.descriptor.execute_interval_ms;
                    if task.descriptor.repeat {
                        task.vm.reset();
                        if interval > 0 {
                            task.state =
                                TaskState::Sleeping(now + interval as u64);
                        }
                    } else {
                        task.state = TaskState::Finished;
                    }
                },
                VMResult::Error(msg) => {
                    platform.report(&task.descriptor.name, &msg);
                    if task.descriptor.repeat {
                        task.vm.reset();
                        task.state =
                            TaskState::Sleeping(now + ERROR_BACKOFF_MS);
                    } else {
                        task.state = TaskState::Error(msg);
                    }
                },
                VMResult::OutOfMemory => {
                    platform.report(&task.descriptor.name, "out of memory");
                    if task.descriptor.repeat {
                        task.vm.reset();
                        task.state =
                            TaskState::Sleeping(now + ERROR_BACKOFF_MS);
                    } else {
                        task.state =
                            TaskState::Error("out of memory".to_string());
                    }
                },
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use crate::heap::ValuePool;
    use crate::module::{Metadata, FunctionDef, Module, DSB_VERSION};
    use crate::platform::{ConsolePlatform, EventArg};

    fn module(
        constants: Vec<&str>,
        functions: Vec<(&str, u32, u8)>,
        code: Vec<u8>
    ) -> Rc<Module> {
        let mut m = Module {
            version: DSB_VERSION,
            flags: 0,
            metadata: Metadata {
                heap_size: 4096,
                app_name: "task".to_string(),
                app_version: "0.0".to_string(),
                author: "tests".to_string(),
                timestamp: 0,
                hash_code: 0,
                checksum: 0,
            },
            constants: constants.iter().map(|s| s.to_string()).collect(),
            globals: Vec::new(),
            functions: functions.iter().map(|(n, pc, argc)| FunctionDef {
                name: n.to_string(),
                entry_pc: *pc,
                param_count: *argc,
            }).collect(),
            main_entry_point: 0,
            code,
            debug_lines: Vec::new(),
        };
        m.seal();
        Rc::new(m)
    }

    fn vm_for(m: Rc<Module>) -> VM {
        let heap = m.metadata.heap_size as usize;
        VM::new(m, ValuePool::new(heap))
    }

    // PUSH_I8 1; PRINT; HALT
    fn print_module() -> Rc<Module> {
        module(vec![], vec![], vec![0x13, 0x01, 0xF0, 0xFF])
    }

    // PUSH_TRUE; PUSH_TRUE; SUB -- faults with a type mismatch
    fn faulty_module() -> Rc<Module> {
        module(vec![], vec![], vec![0x11, 0x11, 0x41, 0xFF])
    }

    // grows a string forever inside a 64-byte pool
    fn hungry_module() -> Rc<Module> {
        let mut m = Module {
            version: DSB_VERSION,
            flags: 0,
            metadata: Metadata {
                heap_size: 64,
                app_name: "hungry".to_string(),
                app_version: "0.0".to_string(),
                author: "tests".to_string(),
                timestamp: 0,
                hash_code: 0,
                checksum: 0,
            },
            constants: vec!["xxxxxxxx".to_string()],
            globals: vec!["acc".to_string()],
            functions: Vec::new(),
            main_entry_point: 0,
            code: vec![
                0x17, 0x00, 0x00,              // PUSH_STR 0
                0x23, 0x00, 0x00,              // STORE_GLOBAL 0
                0x22, 0x00, 0x00,              // 6: LOAD_GLOBAL 0
                0x17, 0x00, 0x00,              // PUSH_STR 0
                0x46,                          // STR_CONCAT
                0x23, 0x00, 0x00,              // STORE_GLOBAL 0
                0x60, 0xF1, 0xFF, 0xFF, 0xFF,  // JUMP -15 -> 6
            ],
            debug_lines: Vec::new(),
        };
        m.seal();
        Rc::new(m)
    }

    // system.sleep(50); PUSH_I8 2; PRINT; HALT
    fn sleepy_module() -> Rc<Module> {
        module(vec![], vec![], vec![
            0x13, 50,                  // PUSH_I8 50
            0x71, 0x51, 0x00, 0x01,    // CALL_NATIVE system.sleep, argc 1
            0x13, 0x02,                // PUSH_I8 2
            0xF0,                      // PRINT
            0xFF,                      // HALT
        ])
    }

    // f(delta) { print delta }; events.registerCallback("encoder.turn", f)
    fn listener_module() -> Rc<Module> {
        module(
            vec!["encoder.turn"],
            vec![("f", 5, 1)],
            vec![
                0x60, 0x05, 0x00, 0x00, 0x00,  // JUMP over the body
                0x20, 0x00,                    // 5: LOAD_LOCAL 0
                0xF0,                          // 7: PRINT
                0x10,                          // 8: PUSH_NULL
                0x74,                          // 9: RETURN
                0x17, 0x00, 0x00,              // 10: PUSH_STR 0
                0x75, 0x00, 0x00,              // 13: LOAD_FUNCTION 0
                0x71, 0x30, 0x01, 0x02,        // 16: CALL_NATIVE register, 2
                0x01,                          // 20: POP
                0xFF,                          // 21: HALT
            ]
        )
    }

    // registers an app.onLoad handler, then prints 1 and finishes
    fn onload_module() -> Rc<Module> {
        module(
            vec!["app.onLoad", "loaded"],
            vec![("onLoad", 5, 0)],
            vec![
                0x60, 0x06, 0x00, 0x00, 0x00,  // JUMP over the handler
                0x17, 0x01, 0x00,              // 5: PUSH_STR 1
                0xF0,                          // 8: PRINT
                0x10,                          // 9: PUSH_NULL
                0x74,                          // 10: RETURN
                0x17, 0x00, 0x00,              // 11: PUSH_STR 0
                0x75, 0x00, 0x00,              // 14: LOAD_FUNCTION 0
                0x71, 0x30, 0x01, 0x02,        // 17: CALL_NATIVE register, 2
                0x01,                          // 21: POP
                0x13, 0x01,                    // 22: PUSH_I8 1
                0xF0,                          // 24: PRINT
                0xFF,                          // 25: HALT
            ]
        )
    }

    fn descriptor(name: &str, repeat: bool, interval: u32) -> AppletDescriptor {
        AppletDescriptor {
            name: name.to_string(),
            repeat,
            execute_interval_ms: interval,
        }
    }

    #[test]
    fn test_one_shot_runs_once_and_parks() {
        let mut scheduler = Scheduler::new();
        let mut platform = ConsolePlatform::new();
        scheduler.spawn(vm_for(print_module()), descriptor("app", false, 0));

        for now in 0..5 {
            platform.set_now(now * 10);
            scheduler.tick(&mut platform);
        }
        assert_eq!(platform.console, vec!["1"]);
        assert_eq!(scheduler.task("app").unwrap().state, TaskState::Finished);
    }

    #[test]
    fn test_repeating_applet_follows_its_interval() {
        let mut scheduler = Scheduler::new();
        let mut platform = ConsolePlatform::new();
        scheduler.spawn(vm_for(print_module()), descriptor("app", true, 100));

        // simulated 350 ms in 10 ms ticks
        for step in 0..=35 {
            platform.set_now(step * 10);
            scheduler.tick(&mut platform);
        }
        // one run at t=0, 100, 200, 300
        assert_eq!(platform.console, vec!["1", "1", "1", "1"]);
        match scheduler.task("app").unwrap().state {
            TaskState::Sleeping(wake) => assert_eq!(wake, 400),
            ref other => panic!("expected sleeping, got {:?}", other)
        }
    }

    #[test]
    fn test_zero_interval_repeats_every_tick() {
        let mut scheduler = Scheduler::new();
        let mut platform = ConsolePlatform::new();
        scheduler.spawn(vm_for(print_module()), descriptor("app", true, 0));

        for now in 0..3 {
            platform.set_now(now);
            scheduler.tick(&mut platform);
        }
        assert_eq!(platform.console, vec!["1", "1", "1"]);
        assert_eq!(scheduler.task("app").unwrap().state, TaskState::Running);
    }

    #[test]
    fn test_sleep_suspends_until_wake() {
        let mut scheduler = Scheduler::new();
        let mut platform = ConsolePlatform::new();
        scheduler.spawn(vm_for(sleepy_module()), descriptor("app", false, 0));

        platform.set_now(0);
        scheduler.tick(&mut platform);
        assert_eq!(platform.console.len(), 0);
        match scheduler.task("app").unwrap().state {
            TaskState::Sleeping(wake) => assert_eq!(wake, 50),
            ref other => panic!("expected sleeping, got {:?}", other)
        }

        // not yet
        platform.set_now(30);
        scheduler.tick(&mut platform);
        assert_eq!(platform.console.len(), 0);

        platform.set_now(50);
        scheduler.tick(&mut platform);
        assert_eq!(platform.console, vec!["2"]);
        assert_eq!(scheduler.task("app").unwrap().state, TaskState::Finished);
    }

    #[test]
    fn test_faulty_one_shot_parks_with_error() {
        let mut scheduler = Scheduler::new();
        let mut platform = ConsolePlatform::new();
        scheduler.spawn(vm_for(faulty_module()), descriptor("app", false, 0));

        platform.set_now(0);
        scheduler.tick(&mut platform);
        match scheduler.task("app").unwrap().state {
            TaskState::Error(ref msg) =>
                assert!(msg.contains("type mismatch"), "{}", msg),
            ref other => panic!("expected error, got {:?}", other)
        }
        // the fault was logged
        assert!(platform.console[0].starts_with("error: app:"));

        // and the task never runs again
        platform.set_now(10);
        scheduler.tick(&mut platform);
        assert_eq!(scheduler.task("app").unwrap().exec_count, 1);
    }

    #[test]
    fn test_faulty_repeater_backs_off_and_resets() {
        let mut scheduler = Scheduler::new();
        let mut platform = ConsolePlatform::new();
        scheduler.spawn(vm_for(faulty_module()), descriptor("app", true, 0));

        platform.set_now(0);
        scheduler.tick(&mut platform);
        match scheduler.task("app").unwrap().state {
            TaskState::Sleeping(wake) => assert_eq!(wake, 5000),
            ref other => panic!("expected backoff, got {:?}", other)
        }

        // after the backoff it faults again, from the top
        platform.set_now(5000);
        scheduler.tick(&mut platform);
        assert_eq!(scheduler.task("app").unwrap().exec_count, 2);
    }

    #[test]
    fn test_callbacks_dispatch_fifo_into_parked_task() {
        let mut scheduler = Scheduler::new();
        let mut platform = ConsolePlatform::new();
        scheduler.spawn(vm_for(listener_module()), descriptor("app", false, 0));

        // top level registers and finishes
        platform.set_now(0);
        scheduler.tick(&mut platform);
        assert_eq!(scheduler.task("app").unwrap().state, TaskState::Finished);

        let baseline = {
            let task = scheduler.task_mut("app").unwrap();
            task.vm.collect_garbage();
            task.vm.pool().allocated()
        };

        platform.emit("encoder.turn", vec![EventArg::Int(1)]);
        platform.emit("encoder.turn", vec![EventArg::Int(-1)]);
        platform.set_now(10);
        scheduler.tick(&mut platform);

        assert_eq!(platform.console, vec!["1", "-1"]);
        // still parked, and the callbacks left no garbage behind
        let task = scheduler.task_mut("app").unwrap();
        assert_eq!(task.state, TaskState::Finished);
        task.vm.collect_garbage();
        assert_eq!(task.vm.pool().allocated(), baseline);
    }

    #[test]
    fn test_oom_task_is_logged_and_parked() {
        let mut scheduler = Scheduler::new();
        let mut platform = ConsolePlatform::new();
        scheduler.spawn(vm_for(hungry_module()), descriptor("app", false, 0));

        platform.set_now(0);
        scheduler.tick(&mut platform);
        assert_eq!(
            scheduler.task("app").unwrap().state,
            TaskState::Error("out of memory".to_string())
        );
        assert!(platform.console[0].contains("out of memory"));
    }

    #[test]
    fn test_onload_leaves_the_reset_main_stack_clean() {
        // the budget is sized so one tick runs exactly the four
        // handler instructions, stopping right after its RETURN lands
        // back on the freshly reset main program
        let mut scheduler = Scheduler::with_budget(4);
        let mut platform = ConsolePlatform::new();
        scheduler.spawn(vm_for(onload_module()), descriptor("app", true, 0));

        // main takes two slices: register, then print and finish
        platform.set_now(0);
        scheduler.tick(&mut platform);
        platform.set_now(1);
        scheduler.tick(&mut platform);
        assert_eq!(platform.console, vec!["1"]);

        // the reset VM serves app.onLoad before rerunning main
        platform.set_now(2);
        scheduler.tick(&mut platform);
        assert_eq!(platform.console, vec!["1", "loaded"]);
        let task = scheduler.task("app").unwrap();
        assert_eq!(task.state, TaskState::Running);
        // the handler's return value must not leak onto main's stack
        assert_eq!(task.vm.stack_depth(), 0);
        assert_eq!(task.vm.call_depth(), 1);

        // the rerun behaves exactly like the first run
        platform.set_now(3);
        scheduler.tick(&mut platform);
        platform.set_now(4);
        scheduler.tick(&mut platform);
        assert_eq!(platform.console, vec!["1", "loaded", "1"]);
    }

    #[test]
    fn test_events_only_reach_registered_tasks() {
        let mut scheduler = Scheduler::new();
        let mut platform = ConsolePlatform::new();
        scheduler.spawn(vm_for(listener_module()), descriptor("ears", false, 0));
        scheduler.spawn(vm_for(print_module()), descriptor("mute", false, 0));

        platform.set_now(0);
        scheduler.tick(&mut platform);
        platform.console.clear();

        platform.emit("encoder.turn", vec![EventArg::Int(7)]);
        platform.set_now(10);
        scheduler.tick(&mut platform);
        assert_eq!(platform.console, vec!["7"]);
        assert!(!scheduler.task("mute").unwrap().vm.has_pending_callbacks());
    }

    #[test]
    fn test_round_robin_order_is_fixed() {
        let mut scheduler = Scheduler::with_budget(10);
        let mut platform = ConsolePlatform::new();
        scheduler.spawn(vm_for(print_module()), descriptor("a", true, 0));
        scheduler.spawn(vm_for(print_module()), descriptor("b", true, 0));

        platform.set_now(0);
        scheduler.tick(&mut platform);
        platform.set_now(1);
        scheduler.tick(&mut platform);
        assert_eq!(platform.console, vec!["1", "1", "1", "1"]);
        assert_eq!(scheduler.task("a").unwrap().exec_count, 2);
        assert_eq!(scheduler.task("b").unwrap().exec_count, 2);
    }

    #[test]
    fn test_terminate_removes_the_task() {
        let mut scheduler = Scheduler::new();
        let mut platform = ConsolePlatform::new();
        scheduler.spawn(vm_for(print_module()), descriptor("app", true, 0));

        platform.set_now(0);
        scheduler.tick(&mut platform);
        assert!(scheduler.terminate("app"));
        assert!(!scheduler.terminate("app"));
        assert!(scheduler.task("app").is_none());

        platform.set_now(1);
        scheduler.tick(&mut platform);
        assert_eq!(platform.console, vec!["1"]);
    }

    #[test]
    fn test_paused_task_gets_no_slices() {
        let mut scheduler = Scheduler::new();
        let mut platform = ConsolePlatform::new();
        scheduler.spawn(vm_for(print_module()), descriptor("app", true, 0));

        platform.set_now(0);
        scheduler.tick(&mut platform);
        assert!(scheduler.set_paused("app", true));

        platform.set_now(1);
        scheduler.tick(&mut platform);
        assert_eq!(platform.console, vec!["1"]);

        scheduler.set_paused("app", false);
        platform.set_now(2);
        scheduler.tick(&mut platform);
        assert_eq!(platform.console, vec!["1", "1"]);
    }
}
