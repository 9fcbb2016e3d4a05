// The applet manager.
//
// A thin menu over the applet registry: the encoder moves the
// selection, a long-press installs an applet that is not yet on the
// device, a press launches one that is. Launching is the one path that
// has to wire everything together correctly: blob -> Module -> a fresh
// pool of the module's declared budget -> VM -> scheduler task. The
// installed-app list is mirrored to apps/registry.json through the
// platform's host-side store.

use serde::{Deserialize, Serialize};

use crate::heap::ValuePool;
use crate::module::{LoadError, Module};
use crate::natives::NativeCall;
use crate::platform::Platform;
use crate::scheduler::{AppletDescriptor, Scheduler};
use crate::value::Value;
use crate::vm::VM;

use std::rc::Rc;


pub const REGISTRY_PATH: &str = "apps/registry.json";

// Scratch pool for menu rendering through the display natives.
const MENU_POOL_BYTES: usize = 2048;
const MENU_ROW_HEIGHT: i32 = 20;


// An applet the menu can offer: its descriptor and its compiled blob.
#[derive(Clone, Debug)]
pub struct AppletEntry {
    pub descriptor: AppletDescriptor,
    pub blob: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ManagerAction {
    Installed,
    Launched,
}

// What apps/registry.json holds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    pub apps: Vec<RegistryRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub name: String,
    pub app_version: String,
    pub author: String,
    pub heap_size: u32,
    pub path: String,
}

impl Registry {
    pub fn from_json(bytes: &[u8]) -> Option<Registry> {
        serde_json::from_slice(bytes).ok()
    }
}


pub fn install_path(name: &str) -> String {
    format!("/applets/{}.dsb", name)
}


pub struct AppletManager {
    entries: Vec<AppletEntry>,
    selected: usize,
    menu_pool: ValuePool,
}

impl AppletManager {
    pub fn new(entries: Vec<AppletEntry>) -> AppletManager {
        AppletManager {
            entries,
            selected: 0,
            menu_pool: ValuePool::new(MENU_POOL_BYTES),
        }
    }

    pub fn entries(&self) -> &[AppletEntry] {
        &self.entries
    }

    pub fn selected(&self) -> usize {
        self.selected
    }

    // Encoder deltas move the selection, wrapping at both ends.
    pub fn handle_encoder(&mut self, delta: i32) {
        if self.entries.is_empty() {
            return;
        }
        let len = self.entries.len() as i32;
        let position = self.selected as i32 + delta;
        self.selected = position.rem_euclid(len) as usize;
    }

    pub fn is_installed(&self, platform: &impl Platform, index: usize) -> bool {
        match self.entries.get(index) {
            Some(entry) =>
                platform.fetch_blob(&install_path(&entry.descriptor.name))
                    .is_some(),
            None => false
        }
    }

    // Long-press on an uninstalled applet installs it; otherwise the
    // press launches.
    pub fn activate(
        &mut self,
        platform: &mut impl Platform,
        scheduler: &mut Scheduler
    ) -> Result<ManagerAction, LoadError> {
        let index = self.selected;
        if self.is_installed(platform, index) {
            self.launch(platform, scheduler, index)
                .map(|_| ManagerAction::Launched)
        } else {
            self.install(platform, index)
                .map(|_| ManagerAction::Installed)
        }
    }

    // Copy the blob into the RAM FS and refresh the registry mirror.
    // The blob is validated first so a corrupt applet never reaches the
    // device store.
    pub fn install(
        &mut self,
        platform: &mut impl Platform,
        index: usize
    ) -> Result<(), LoadError> {
        let entry = match self.entries.get(index) {
            Some(entry) => entry,
            None => return Err(LoadError::Truncated)
        };
        let module = Module::load(&entry.blob)?;
        trace!("install {} v{}", module.metadata.app_name,
               module.metadata.app_version);
        platform.store_blob(
            &install_path(&entry.descriptor.name),
            &entry.blob
        );
        self.persist_registry(platform);
        Ok(())
    }

    // Launch = Module + Heap + VM + scheduler task, bound in that
    // order. The task picks up app.onLoad once its top level has run.
    pub fn launch(
        &mut self,
        platform: &mut impl Platform,
        scheduler: &mut Scheduler,
        index: usize
    ) -> Result<(), LoadError> {
        let entry = match self.entries.get(index) {
            Some(entry) => entry,
            None => return Err(LoadError::Truncated)
        };
        let path = install_path(&entry.descriptor.name);
        let blob = platform.fetch_blob(&path)
            .unwrap_or_else(|| entry.blob.clone());
        let module = match Module::load(&blob) {
            Ok(module) => Rc::new(module),
            Err(e) => {
                platform.report(
                    &entry.descriptor.name,
                    &format!("load failed: {:?}", e)
                );
                return Err(e);
            }
        };
        let pool = ValuePool::new(module.metadata.heap_size as usize);
        let vm = VM::new(module, pool);
        scheduler.spawn(vm, entry.descriptor.clone());
        Ok(())
    }

    // Rebuild apps/registry.json from whatever is actually installed.
    fn persist_registry(&self, platform: &mut impl Platform) {
        let mut registry = Registry { apps: Vec::new() };
        for entry in &self.entries {
            let path = install_path(&entry.descriptor.name);
            let blob = match platform.fetch_blob(&path) {
                Some(blob) => blob,
                None => continue
            };
            if let Ok(module) = Module::load(&blob) {
                registry.apps.push(RegistryRecord {
                    name: entry.descriptor.name.clone(),
                    app_version: module.metadata.app_version.clone(),
                    author: module.metadata.author.clone(),
                    heap_size: module.metadata.heap_size,
                    path,
                });
            }
        }
        match serde_json::to_vec_pretty(&registry) {
            Ok(bytes) => platform.store_blob(REGISTRY_PATH, &bytes),
            Err(e) => platform.report("manager", &format!("registry: {}", e))
        }
    }

    // Draw the menu: one row per applet, the selection marked. All
    // strings come from the manager's own scratch pool.
    pub fn render(&mut self, platform: &mut impl Platform) {
        platform.invoke(NativeCall::DisplayClear, &[], &mut self.menu_pool);
        for (i, entry) in self.entries.iter().enumerate() {
            let marker = if i == self.selected { "> " } else { "  " };
            let label = format!("{}{}", marker, entry.descriptor.name);
            let text = match self.menu_pool.allocate_string(&label) {
                Some(r) => Value::Str(r),
                None => {
                    // menu strings are transient; reclaim and retry once
                    self.menu_pool.collect(&[]);
                    match self.menu_pool.allocate_string(&label) {
                        Some(r) => Value::Str(r),
                        None => continue
                    }
                }
            };
            platform.invoke(
                NativeCall::DisplayDrawText,
                &[
                    Value::Int32(10),
                    Value::Int32(20 + i as i32 * MENU_ROW_HEIGHT),
                    text,
                ],
                &mut self.menu_pool
            );
        }
        self.menu_pool.collect(&[]);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Metadata, DSB_VERSION};
    use crate::platform::ConsolePlatform;

    fn blob(name: &str) -> Vec<u8> {
        let mut m = Module {
            version: DSB_VERSION,
            flags: 0,
            metadata: Metadata {
                heap_size: 4096,
                app_name: name.to_string(),
                app_version: "1.0".to_string(),
                author: "tests".to_string(),
                timestamp: 0,
                hash_code: 0,
                checksum: 0,
            },
            constants: Vec::new(),
            globals: Vec::new(),
            functions: Vec::new(),
            main_entry_point: 0,
            // PUSH_I8 1; PRINT; HALT
            code: vec![0x13, 0x01, 0xF0, 0xFF],
            debug_lines: Vec::new(),
        };
        m.seal();
        m.to_bytes()
    }

    fn entry(name: &str) -> AppletEntry {
        AppletEntry {
            descriptor: AppletDescriptor {
                name: name.to_string(),
                repeat: false,
                execute_interval_ms: 0,
            },
            blob: blob(name),
        }
    }

    #[test]
    fn test_encoder_selection_wraps() {
        let mut manager = AppletManager::new(vec![
            entry("clock"), entry("dice"), entry("notes"),
        ]);
        assert_eq!(manager.selected(), 0);
        manager.handle_encoder(1);
        assert_eq!(manager.selected(), 1);
        manager.handle_encoder(2);
        assert_eq!(manager.selected(), 0);
        manager.handle_encoder(-1);
        assert_eq!(manager.selected(), 2);
    }

    #[test]
    fn test_install_then_launch() {
        let mut manager = AppletManager::new(vec![entry("clock")]);
        let mut platform = ConsolePlatform::new();
        let mut scheduler = Scheduler::new();

        // first activation installs
        assert_eq!(
            manager.activate(&mut platform, &mut scheduler),
            Ok(ManagerAction::Installed)
        );
        assert!(platform.fetch_blob("/applets/clock.dsb").is_some());
        assert!(scheduler.task("clock").is_none());

        // second activation launches
        assert_eq!(
            manager.activate(&mut platform, &mut scheduler),
            Ok(ManagerAction::Launched)
        );
        assert!(scheduler.task("clock").is_some());

        platform.set_now(0);
        scheduler.tick(&mut platform);
        assert_eq!(platform.console, vec!["1"]);
    }

    #[test]
    fn test_registry_mirror() {
        let mut manager = AppletManager::new(vec![entry("clock"), entry("dice")]);
        let mut platform = ConsolePlatform::new();

        manager.install(&mut platform, 0).unwrap();
        manager.install(&mut platform, 1).unwrap();

        let json = platform.fetch_blob(REGISTRY_PATH).unwrap();
        let registry = Registry::from_json(&json).unwrap();
        assert_eq!(registry.apps.len(), 2);
        assert_eq!(registry.apps[0].name, "clock");
        assert_eq!(registry.apps[0].path, "/applets/clock.dsb");
        assert_eq!(registry.apps[0].heap_size, 4096);
        assert_eq!(registry.apps[1].author, "tests");
    }

    #[test]
    fn test_corrupt_blob_does_not_install() {
        let mut broken = entry("bad");
        broken.blob[10] ^= 0xFF;
        let mut manager = AppletManager::new(vec![broken]);
        let mut platform = ConsolePlatform::new();
        let mut scheduler = Scheduler::new();

        match manager.activate(&mut platform, &mut scheduler) {
            Err(_) => (),
            Ok(action) => panic!("corrupt blob accepted: {:?}", action)
        }
        assert!(platform.fetch_blob("/applets/bad.dsb").is_none());
    }

    #[test]
    fn test_launch_respects_declared_heap_size() {
        let mut manager = AppletManager::new(vec![entry("clock")]);
        let mut platform = ConsolePlatform::new();
        let mut scheduler = Scheduler::new();

        manager.install(&mut platform, 0).unwrap();
        manager.launch(&mut platform, &mut scheduler, 0).unwrap();
        let task = scheduler.task("clock").unwrap();
        assert_eq!(task.vm.pool().heap_size(), 4096);
    }
}
