// The capability boundary between the interpreter and the device.
//
// The VM forwards CALL_NATIVE through Platform::invoke and takes back a
// single value; sleep, yield and exit come back as control outcomes
// instead. Device events (encoder turns, touches, timers, IPC) surface
// through poll_event with pool-free payloads; the scheduler converts
// them to real values inside the receiving applet's pool.
//
// ConsolePlatform is the desktop rendition: console output to stdout, a
// flat in-memory RAM file system, manual time, and structured
// "unsupported" errors for the device-only namespaces. The unit tests
// drive it directly, reading back captured console lines and injecting
// scripted events.

use std::collections::{HashMap, VecDeque};

use crate::heap::ValuePool;
use crate::natives::NativeCall;
use crate::value::Value;


// What a native call did, as the interpreter sees it.
#[derive(Clone, Debug, PartialEq)]
pub enum NativeResult {
    Value(Value),
    Sleep(u32),
    Yield,
    Exit,
}

// Event payloads cross the platform boundary without touching any pool.
#[derive(Clone, Debug, PartialEq)]
pub enum EventArg {
    Null,
    Bool(bool),
    Int(i32),
    Float(f32),
    Str(String),
}

impl EventArg {
    pub fn to_value(&self, pool: &mut ValuePool) -> Option<Value> {
        match self {
            EventArg::Null => Some(Value::Null),
            EventArg::Bool(v) => Some(Value::Bool(*v)),
            EventArg::Int(v) => Some(Value::Int32(*v)),
            EventArg::Float(v) => Some(Value::Float32(*v)),
            EventArg::Str(s) => pool.allocate_string(s).map(Value::Str),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlatformEvent {
    pub name: String,
    pub args: Vec<EventArg>,
}


pub trait Platform {
    fn invoke(
        &mut self,
        call: NativeCall,
        args: &[Value],
        pool: &mut ValuePool
    ) -> NativeResult;

    fn now_ms(&self) -> u64;

    fn poll_event(&mut self) -> Option<PlatformEvent>;

    // Host-side RAM FS access for the applet manager; scripts go through
    // the file.* natives instead.
    fn store_blob(&mut self, path: &str, blob: &[u8]);
    fn fetch_blob(&self, path: &str) -> Option<Vec<u8>>;

    // Scheduler-facing diagnostics channel.
    fn report(&mut self, source: &str, message: &str);
}


// The documented error value for a call the platform does not support:
// an Object of class PlatformError with the offending call's name. Null
// if the applet's pool cannot even hold that.
pub fn unsupported(call: NativeCall, pool: &mut ValuePool) -> NativeResult {
    let obj = match pool.allocate_object("PlatformError") {
        Some(obj) => obj,
        None => return NativeResult::Value(Value::Null)
    };
    let filled = pool.allocate_string("unsupported")
        .and_then(|msg| pool.field_set(obj, "message", Value::Str(msg)))
        .and_then(|_| pool.allocate_string(call.name()))
        .and_then(|name| pool.field_set(obj, "call", Value::Str(name)));
    match filled {
        Some(()) => NativeResult::Value(Value::Object(obj)),
        None => NativeResult::Value(Value::Null)
    }
}


fn arg_i32(args: &[Value], index: usize) -> Option<i32> {
    match args.get(index) {
        Some(Value::Int32(v)) => Some(*v),
        Some(Value::Float32(v)) => Some(*v as i32),
        _ => None
    }
}

fn arg_str<'a>(args: &[Value], index: usize, pool: &'a ValuePool) -> Option<&'a str> {
    match args.get(index) {
        Some(Value::Str(r)) => Some(pool.str_content(*r)),
        _ => None
    }
}


struct Timer {
    id: i32,
    deadline: u64,
    interval: Option<u64>,
    event: String,
}


pub struct ConsolePlatform {
    now: u64,
    pub console: Vec<String>,
    events: VecDeque<PlatformEvent>,
    files: HashMap<String, Vec<u8>>,
    handles: HashMap<i32, (String, usize)>,
    next_fd: i32,
    timers: Vec<Timer>,
    next_timer: i32,
    rtc: i32,
    pub encoder_delta: i32,
    pub encoder_position: i32,
    pub encoder_button: bool,
    pub touch: (i32, i32, bool),
}

impl ConsolePlatform {
    pub fn new() -> ConsolePlatform {
        ConsolePlatform {
            now: 0,
            console: Vec::new(),
            events: VecDeque::new(),
            files: HashMap::new(),
            handles: HashMap::new(),
            next_fd: 1,
            timers: Vec::new(),
            next_timer: 1,
            rtc: 0,
            encoder_delta: 0,
            encoder_position: 0,
            encoder_button: false,
            touch: (0, 0, false),
        }
    }

    // The host loop is the only clock reader; everything in here works
    // off the time it sets.
    pub fn set_now(&mut self, now_ms: u64) {
        self.now = now_ms;
    }

    pub fn emit(&mut self, name: &str, args: Vec<EventArg>) {
        self.events.push_back(PlatformEvent {
            name: name.to_string(),
            args
        });
    }

    fn say(&mut self, line: String) {
        println!("{}", line);
        self.console.push(line);
    }

    fn console_line(&self, args: &[Value], pool: &ValuePool) -> String {
        args.iter()
            .map(|v| v.stringify(pool))
            .collect::<Vec<String>>()
            .join(" ")
    }

    fn set_timer(&mut self, args: &[Value], pool: &ValuePool, repeat: bool) -> NativeResult {
        let event = match arg_str(args, 0, pool) {
            Some(name) => name.to_string(),
            None => return NativeResult::Value(Value::Null)
        };
        let ms = arg_i32(args, 1).unwrap_or(0).max(0) as u64;
        let id = self.next_timer;
        self.next_timer += 1;
        self.timers.push(Timer {
            id,
            deadline: self.now + ms,
            interval: if repeat { Some(ms) } else { None },
            event,
        });
        NativeResult::Value(Value::Int32(id))
    }

    fn clear_timer(&mut self, args: &[Value]) -> NativeResult {
        let id = arg_i32(args, 0).unwrap_or(0);
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        NativeResult::Value(Value::Bool(self.timers.len() != before))
    }
}

impl Platform for ConsolePlatform {
    fn invoke(
        &mut self,
        call: NativeCall,
        args: &[Value],
        pool: &mut ValuePool
    ) -> NativeResult {
        use NativeCall::*;
        match call {
            ConsolePrint | ConsoleLog => {
                let line = self.console_line(args, pool);
                self.say(line);
                NativeResult::Value(Value::Null)
            },
            ConsoleWarn => {
                let line = format!("warn: {}", self.console_line(args, pool));
                self.say(line);
                NativeResult::Value(Value::Null)
            },
            ConsoleError => {
                let line = format!("error: {}", self.console_line(args, pool));
                self.say(line);
                NativeResult::Value(Value::Null)
            },

            DisplayWidth | DisplayHeight =>
                NativeResult::Value(Value::Int32(240)),
            DisplayClear | DisplayDrawText | DisplayDrawRect
            | DisplayDrawCircle | DisplayDrawLine | DisplayDrawPixel
            | DisplaySetBrightness | DisplaySetTitle | DisplayDrawImage => {
                trace!("display: {} {:?}", call.name(), args);
                NativeResult::Value(Value::Null)
            },

            EncoderGetButton =>
                NativeResult::Value(Value::Bool(self.encoder_button)),
            EncoderGetDelta => {
                let delta = self.encoder_delta;
                self.encoder_delta = 0;
                NativeResult::Value(Value::Int32(delta))
            },
            EncoderGetPosition =>
                NativeResult::Value(Value::Int32(self.encoder_position)),
            EncoderReset => {
                self.encoder_position = 0;
                self.encoder_delta = 0;
                NativeResult::Value(Value::Null)
            },

            TouchX => NativeResult::Value(Value::Int32(self.touch.0)),
            TouchY => NativeResult::Value(Value::Int32(self.touch.1)),
            TouchIsPressed => NativeResult::Value(Value::Bool(self.touch.2)),

            SystemGetTime =>
                NativeResult::Value(Value::Int32(self.now as u32 as i32)),
            SystemSleep => {
                let ms = arg_i32(args, 0).unwrap_or(0).max(0) as u32;
                NativeResult::Sleep(ms)
            },
            SystemYield => NativeResult::Yield,
            SystemGetRtc => NativeResult::Value(Value::Int32(self.rtc)),
            SystemSetRtc => {
                self.rtc = arg_i32(args, 0).unwrap_or(0);
                NativeResult::Value(Value::Null)
            },

            FileOpen => {
                let path = match arg_str(args, 0, pool) {
                    Some(p) => p.to_string(),
                    None => return NativeResult::Value(Value::Null)
                };
                let truncate = arg_str(args, 1, pool) == Some("w");
                if truncate || !self.files.contains_key(&path) {
                    self.files.insert(path.clone(), Vec::new());
                }
                let fd = self.next_fd;
                self.next_fd += 1;
                self.handles.insert(fd, (path, 0));
                NativeResult::Value(Value::Int32(fd))
            },
            FileRead => {
                let fd = arg_i32(args, 0).unwrap_or(-1);
                let content = match self.handles.get(&fd) {
                    Some((path, pos)) => {
                        let data = &self.files[path];
                        let pos = (*pos).min(data.len());
                        String::from_utf8_lossy(&data[pos..]).into_owned()
                    },
                    None => return NativeResult::Value(Value::Null)
                };
                if let Some(entry) = self.handles.get_mut(&fd) {
                    entry.1 = self.files[entry.0.as_str()].len();
                }
                match pool.allocate_string(&content) {
                    Some(r) => NativeResult::Value(Value::Str(r)),
                    None => NativeResult::Value(Value::Null)
                }
            },
            FileWrite => {
                let fd = arg_i32(args, 0).unwrap_or(-1);
                let payload = match arg_str(args, 1, pool) {
                    Some(s) => s.as_bytes().to_vec(),
                    None => return NativeResult::Value(Value::Int32(0))
                };
                let path = match self.handles.get(&fd) {
                    Some((path, _)) => path.clone(),
                    None => return NativeResult::Value(Value::Int32(0))
                };
                let written = payload.len();
                if let Some(data) = self.files.get_mut(&path) {
                    data.extend_from_slice(&payload);
                }
                NativeResult::Value(Value::Int32(written as i32))
            },
            FileClose => {
                let fd = arg_i32(args, 0).unwrap_or(-1);
                self.handles.remove(&fd);
                NativeResult::Value(Value::Null)
            },
            FileExists => {
                let exists = arg_str(args, 0, pool)
                    .map(|p| self.files.contains_key(p))
                    .unwrap_or(false);
                NativeResult::Value(Value::Bool(exists))
            },
            FileDelete => {
                let removed = match arg_str(args, 0, pool) {
                    Some(p) => {
                        let p = p.to_string();
                        self.files.remove(&p).is_some()
                    },
                    None => false
                };
                NativeResult::Value(Value::Bool(removed))
            },
            FileSize => {
                let size = arg_str(args, 0, pool)
                    .and_then(|p| self.files.get(p))
                    .map(|data| data.len() as i32)
                    .unwrap_or(-1);
                NativeResult::Value(Value::Int32(size))
            },

            DirList => {
                let prefix = match arg_str(args, 0, pool) {
                    Some(p) => p.to_string(),
                    None => String::new()
                };
                let mut names: Vec<String> = self.files.keys()
                    .filter(|path| path.starts_with(&prefix))
                    .cloned()
                    .collect();
                names.sort();
                let arr = match pool.allocate_array(0) {
                    Some(arr) => arr,
                    None => return NativeResult::Value(Value::Null)
                };
                for name in names {
                    let entry = match pool.allocate_string(&name) {
                        Some(r) => Value::Str(r),
                        None => return NativeResult::Value(Value::Null)
                    };
                    if pool.array_push(arr, entry).is_none() {
                        return NativeResult::Value(Value::Null);
                    }
                }
                NativeResult::Value(Value::Array(arr))
            },
            // the RAM FS namespace is flat; directories exist by prefix
            DirCreate => NativeResult::Value(Value::Bool(true)),
            DirDelete => NativeResult::Value(Value::Bool(false)),
            DirExists => {
                let exists = match arg_str(args, 0, pool) {
                    Some(prefix) =>
                        self.files.keys().any(|p| p.starts_with(prefix)),
                    None => false
                };
                NativeResult::Value(Value::Bool(exists))
            },

            TimerSetTimeout => self.set_timer(args, pool, false),
            TimerSetInterval => self.set_timer(args, pool, true),
            TimerClearTimeout | TimerClearInterval => self.clear_timer(args),

            AppExit => NativeResult::Exit,

            IpcSend | IpcBroadcast => {
                let name = match arg_str(args, 0, pool) {
                    Some(n) => n.to_string(),
                    None => return NativeResult::Value(Value::Bool(false))
                };
                let payload = args[1..].iter().map(|v| match v {
                    Value::Null => EventArg::Null,
                    Value::Bool(b) => EventArg::Bool(*b),
                    Value::Int32(i) => EventArg::Int(*i),
                    Value::Float32(f) => EventArg::Float(*f),
                    other => EventArg::Str(other.stringify(pool)),
                }).collect();
                self.emit(&name, payload);
                NativeResult::Value(Value::Bool(true))
            },

            // intercepted by the VM; reaching here means a bare pool
            MemoryGetAvailable | MemoryGetUsage | EventsRegisterCallback =>
                NativeResult::Value(Value::Null),

            // no hardware behind the desktop build
            GpioMode | GpioRead | GpioWrite
            | I2cScan | I2cRead | I2cWrite
            | BuzzerTone | BuzzerStop | BuzzerBeep
            | RfidIsPresent | RfidReadUid
            | PowerBatteryLevel | PowerIsCharging | PowerSleep | PowerOff
            | AppGetInfo | AppInstall | AppUninstall | AppList
            | AppGetMetadata | AppLaunch | AppValidate
            | WifiConnect | WifiDisconnect | WifiStatus | WifiScan
            | HttpGet | HttpPost => unsupported(call, pool),
        }
    }

    fn now_ms(&self) -> u64 {
        self.now
    }

    fn poll_event(&mut self) -> Option<PlatformEvent> {
        // due timers fire ahead of queued events
        let now = self.now;
        if let Some(i) = self.timers.iter().position(|t| t.deadline <= now) {
            let event = self.timers[i].event.clone();
            match self.timers[i].interval {
                Some(ms) => self.timers[i].deadline = now + ms.max(1),
                None => { self.timers.remove(i); }
            }
            return Some(PlatformEvent { name: event, args: Vec::new() });
        }
        self.events.pop_front()
    }

    fn store_blob(&mut self, path: &str, blob: &[u8]) {
        self.files.insert(path.to_string(), blob.to_vec());
    }

    fn fetch_blob(&self, path: &str) -> Option<Vec<u8>> {
        self.files.get(path).cloned()
    }

    fn report(&mut self, source: &str, message: &str) {
        let line = format!("error: {}: {}", source, message);
        eprintln!("{}", line);
        self.console.push(line);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ValuePool {
        ValuePool::new(8192)
    }

    #[test]
    fn test_console_capture() {
        let mut platform = ConsolePlatform::new();
        let mut pool = pool();
        let s = pool.allocate_string("hello").unwrap();
        platform.invoke(
            NativeCall::ConsoleLog,
            &[Value::Str(s), Value::Int32(5)],
            &mut pool
        );
        assert_eq!(platform.console, vec!["hello 5"]);
    }

    #[test]
    fn test_sleep_and_yield_outcomes() {
        let mut platform = ConsolePlatform::new();
        let mut pool = pool();
        assert_eq!(
            platform.invoke(NativeCall::SystemSleep, &[Value::Int32(250)], &mut pool),
            NativeResult::Sleep(250)
        );
        assert_eq!(
            platform.invoke(NativeCall::SystemYield, &[], &mut pool),
            NativeResult::Yield
        );
        assert_eq!(
            platform.invoke(NativeCall::AppExit, &[], &mut pool),
            NativeResult::Exit
        );
    }

    #[test]
    fn test_ram_fs() {
        let mut platform = ConsolePlatform::new();
        let mut pool = pool();
        let path = Value::Str(pool.allocate_string("/data/log.txt").unwrap());
        let mode = Value::Str(pool.allocate_string("w").unwrap());
        let payload = Value::Str(pool.allocate_string("abc").unwrap());

        let fd = match platform.invoke(NativeCall::FileOpen, &[path, mode], &mut pool) {
            NativeResult::Value(Value::Int32(fd)) => fd,
            other => panic!("open failed: {:?}", other)
        };
        platform.invoke(NativeCall::FileWrite, &[Value::Int32(fd), payload], &mut pool);
        platform.invoke(NativeCall::FileClose, &[Value::Int32(fd)], &mut pool);

        assert_eq!(
            platform.invoke(NativeCall::FileSize, &[path], &mut pool),
            NativeResult::Value(Value::Int32(3))
        );
        assert_eq!(
            platform.invoke(NativeCall::FileExists, &[path], &mut pool),
            NativeResult::Value(Value::Bool(true))
        );
    }

    #[test]
    fn test_unsupported_is_structured() {
        let mut platform = ConsolePlatform::new();
        let mut pool = pool();
        match platform.invoke(NativeCall::RfidReadUid, &[], &mut pool) {
            NativeResult::Value(Value::Object(obj)) => {
                assert_eq!(pool.object_class(obj), "PlatformError");
                let msg = pool.field_get(obj, "message").unwrap();
                assert_eq!(msg.stringify(&pool), "unsupported");
            },
            other => panic!("expected error object, got {:?}", other)
        }
    }

    #[test]
    fn test_timers_fire_as_events() {
        let mut platform = ConsolePlatform::new();
        let mut pool = pool();
        let name = Value::Str(pool.allocate_string("tick").unwrap());
        platform.invoke(
            NativeCall::TimerSetTimeout,
            &[name, Value::Int32(100)],
            &mut pool
        );
        assert_eq!(platform.poll_event(), None);
        platform.set_now(100);
        let fired = platform.poll_event().unwrap();
        assert_eq!(fired.name, "tick");
        assert_eq!(platform.poll_event(), None);
    }
}
