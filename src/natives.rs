// Native entry points reachable through CALL_NATIVE.
//
// The id space is part of the wire format: u16 ids, one block of 16 per
// namespace. The interpreter forwards arguments and takes back a single
// value without understanding any call's semantics; only the handful of
// VM-local calls (events.registerCallback, memory.*) are intercepted
// before they reach the platform.

macro_rules! natives {
    ( $( $variant:ident = $id:literal => $name:literal ),+ $(,)? ) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq)]
        pub enum NativeCall {
            $( $variant ),+
        }

        impl NativeCall {
            pub fn from_u16(id: u16) -> Option<NativeCall> {
                match id {
                    $( $id => Some(NativeCall::$variant), )+
                    _ => None
                }
            }

            pub fn id(self) -> u16 {
                match self {
                    $( NativeCall::$variant => $id ),+
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( NativeCall::$variant => $name ),+
                }
            }
        }
    }
}

natives! {
    ConsolePrint        = 0x0000 => "console.print",
    ConsoleLog          = 0x0001 => "console.log",
    ConsoleWarn         = 0x0002 => "console.warn",
    ConsoleError        = 0x0003 => "console.error",

    DisplayClear        = 0x0010 => "display.clear",
    DisplayDrawText     = 0x0011 => "display.drawText",
    DisplayDrawRect     = 0x0012 => "display.drawRect",
    DisplayDrawCircle   = 0x0013 => "display.drawCircle",
    DisplayDrawLine     = 0x0014 => "display.drawLine",
    DisplayDrawPixel    = 0x0015 => "display.drawPixel",
    DisplaySetBrightness = 0x0016 => "display.setBrightness",
    DisplayWidth        = 0x0017 => "display.width",
    DisplayHeight       = 0x0018 => "display.height",
    DisplaySetTitle     = 0x0019 => "display.setTitle",
    DisplayDrawImage    = 0x001A => "display.drawImage",

    EncoderGetButton    = 0x0030 => "encoder.getButton",
    EncoderGetDelta     = 0x0031 => "encoder.getDelta",
    EncoderGetPosition  = 0x0032 => "encoder.getPosition",
    EncoderReset        = 0x0033 => "encoder.reset",

    TouchX              = 0x0040 => "touch.x",
    TouchY              = 0x0041 => "touch.y",
    TouchIsPressed      = 0x0042 => "touch.isPressed",

    SystemGetTime       = 0x0050 => "system.getTime",
    SystemSleep         = 0x0051 => "system.sleep",
    SystemYield         = 0x0052 => "system.yield",
    SystemGetRtc        = 0x0053 => "system.getRTC",
    SystemSetRtc        = 0x0054 => "system.setRTC",

    FileOpen            = 0x0060 => "file.open",
    FileRead            = 0x0061 => "file.read",
    FileWrite           = 0x0062 => "file.write",
    FileClose           = 0x0063 => "file.close",
    FileExists          = 0x0064 => "file.exists",
    FileDelete          = 0x0065 => "file.delete",
    FileSize            = 0x0066 => "file.size",

    DirList             = 0x0070 => "dir.list",
    DirCreate           = 0x0071 => "dir.create",
    DirDelete           = 0x0072 => "dir.delete",
    DirExists           = 0x0073 => "dir.exists",

    GpioMode            = 0x0080 => "gpio.mode",
    GpioRead            = 0x0081 => "gpio.read",
    GpioWrite           = 0x0082 => "gpio.write",

    I2cScan             = 0x0090 => "i2c.scan",
    I2cRead             = 0x0091 => "i2c.read",
    I2cWrite            = 0x0092 => "i2c.write",

    BuzzerTone          = 0x00A0 => "buzzer.tone",
    BuzzerStop          = 0x00A1 => "buzzer.stop",
    BuzzerBeep          = 0x00A2 => "buzzer.beep",

    RfidIsPresent       = 0x00B0 => "rfid.isPresent",
    RfidReadUid         = 0x00B1 => "rfid.readUid",

    TimerSetTimeout     = 0x00C0 => "timer.setTimeout",
    TimerSetInterval    = 0x00C1 => "timer.setInterval",
    TimerClearTimeout   = 0x00C2 => "timer.clearTimeout",
    TimerClearInterval  = 0x00C3 => "timer.clearInterval",

    MemoryGetAvailable  = 0x00D0 => "memory.getAvailable",
    MemoryGetUsage      = 0x00D1 => "memory.getUsage",

    PowerBatteryLevel   = 0x00E0 => "power.batteryLevel",
    PowerIsCharging     = 0x00E1 => "power.isCharging",
    PowerSleep          = 0x00E2 => "power.sleep",
    PowerOff            = 0x00E3 => "power.off",

    AppExit             = 0x00F0 => "app.exit",
    AppGetInfo          = 0x00F1 => "app.getInfo",
    AppInstall          = 0x00F2 => "app.install",
    AppUninstall        = 0x00F3 => "app.uninstall",
    AppList             = 0x00F4 => "app.list",
    AppGetMetadata      = 0x00F5 => "app.getMetadata",
    AppLaunch           = 0x00F6 => "app.launch",
    AppValidate         = 0x00F7 => "app.validate",

    IpcSend             = 0x0100 => "ipc.send",
    IpcBroadcast        = 0x0101 => "ipc.broadcast",

    WifiConnect         = 0x0110 => "wifi.connect",
    WifiDisconnect      = 0x0111 => "wifi.disconnect",
    WifiStatus          = 0x0112 => "wifi.status",
    WifiScan            = 0x0113 => "wifi.scan",

    HttpGet             = 0x0120 => "http.get",
    HttpPost            = 0x0121 => "http.post",

    EventsRegisterCallback = 0x0130 => "events.registerCallback",
}
