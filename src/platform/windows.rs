//! Windows process control and named-mutex singleton leases

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    CloseHandle, GetLastError, BOOL, ERROR_ALREADY_EXISTS, FALSE, HANDLE, HWND, LPARAM, LRESULT,
    TRUE, WPARAM,
};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::System::Threading::*;
use windows::Win32::UI::WindowsAndMessaging::*;

use crate::core::bypass::{LeaseMethod, LeaseToken, LockBackend};

/// STILL_ACTIVE exit code
const STILL_ACTIVE: u32 = 259;

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Ask every top-level window of the process to close (WM_CLOSE)
pub fn terminate_process(pid: u32) -> Result<()> {
    unsafe {
        let mut windows: Vec<HWND> = Vec::new();

        unsafe extern "system" fn enum_callback(hwnd: HWND, lparam: LPARAM) -> BOOL {
            let windows = &mut *(lparam.0 as *mut Vec<HWND>);
            windows.push(hwnd);
            BOOL::from(true)
        }

        let _ = EnumWindows(
            Some(enum_callback),
            LPARAM(&mut windows as *mut Vec<HWND> as isize),
        );

        let mut closed = 0;
        for hwnd in windows {
            let mut window_pid: u32 = 0;
            GetWindowThreadProcessId(hwnd, Some(&mut window_pid));
            if window_pid == pid && PostMessageW(hwnd, WM_CLOSE, WPARAM(0), LPARAM(0)).is_ok() {
                closed += 1;
            }
        }

        if closed == 0 {
            anyhow::bail!("Process {} has no windows to close", pid);
        }
        debug!("Posted WM_CLOSE to {} window(s) of PID {}", closed, pid);
        Ok(())
    }
}

/// Force kill a process
pub fn kill_process(pid: u32) -> Result<()> {
    unsafe {
        let handle =
            OpenProcess(PROCESS_TERMINATE, FALSE, pid).context("Failed to open process")?;

        let result = TerminateProcess(handle, 1);
        CloseHandle(handle)?;

        if result.is_ok() {
            Ok(())
        } else {
            anyhow::bail!("Failed to kill process")
        }
    }
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    unsafe {
        let handle = match OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, FALSE, pid) {
            Ok(h) => h,
            Err(_) => return false,
        };

        let mut exit_code: u32 = 0;
        let result = GetExitCodeProcess(handle, &mut exit_code);
        CloseHandle(handle).ok();

        result.is_ok() && exit_code == STILL_ACTIVE
    }
}

/// Priority class expressed on the Unix nice scale (0 = normal)
pub fn get_process_priority(pid: u32) -> Result<i32> {
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, FALSE, pid)
            .context("Failed to open process")?;
        let class = GetPriorityClass(handle);
        let _ = CloseHandle(handle);

        let nice = match PROCESS_CREATION_FLAGS(class) {
            c if c == IDLE_PRIORITY_CLASS => 19,
            c if c == BELOW_NORMAL_PRIORITY_CLASS => 10,
            c if c == ABOVE_NORMAL_PRIORITY_CLASS => -5,
            c if c == HIGH_PRIORITY_CLASS => -10,
            c if c == REALTIME_PRIORITY_CLASS => -20,
            _ => 0,
        };
        Ok(nice)
    }
}

/// Set process priority from a nice-scale value
pub fn set_process_priority(pid: u32, priority: i32) -> Result<()> {
    let priority_class = match priority {
        p if p <= -15 => REALTIME_PRIORITY_CLASS,
        p if p <= -10 => HIGH_PRIORITY_CLASS,
        p if p < 0 => ABOVE_NORMAL_PRIORITY_CLASS,
        0 => NORMAL_PRIORITY_CLASS,
        p if p <= 10 => BELOW_NORMAL_PRIORITY_CLASS,
        _ => IDLE_PRIORITY_CLASS,
    };

    unsafe {
        let handle = OpenProcess(PROCESS_SET_INFORMATION, FALSE, pid)
            .context("Could not open process for priority change")?;
        let result = SetPriorityClass(handle, priority_class);
        let _ = CloseHandle(handle);
        result.context("Failed to set priority class")?;
        debug!("Set process {} priority to {:?}", pid, priority_class);
        Ok(())
    }
}

struct HeldMutex {
    handle: usize,
    owned: bool,
}

struct KeepAliveWindow {
    thread_id: u32,
    thread: JoinHandle<()>,
}

/// Named mutexes plus a hidden message-only window
pub struct WindowsMutexBackend {
    held: Mutex<HashMap<LeaseToken, HeldMutex>>,
    keep_alive: Mutex<HashMap<LeaseToken, KeepAliveWindow>>,
    next_token: AtomicU64,
}

impl WindowsMutexBackend {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            keep_alive: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    fn next(&self) -> LeaseToken {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for WindowsMutexBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LockBackend for WindowsMutexBackend {
    fn methods(&self) -> Vec<&'static str> {
        vec!["named-mutex", "hidden-window"]
    }

    fn claim(&self, name: &str) -> Result<(LeaseToken, LeaseMethod)> {
        let name_w = wide(name);
        let pname = PCWSTR::from_raw(name_w.as_ptr());

        let (handle, method) = unsafe {
            match CreateMutexW(None, TRUE, pname) {
                Ok(handle) if GetLastError() == ERROR_ALREADY_EXISTS => {
                    (handle, LeaseMethod::OpenedExisting)
                }
                Ok(handle) => (handle, LeaseMethod::ClaimedNew),
                Err(create_err) => {
                    let handle = OpenMutexW(MUTEX_ALL_ACCESS, FALSE, pname).with_context(|| {
                        format!("CreateMutexW failed ({}) and OpenMutexW failed", create_err)
                    })?;
                    (handle, LeaseMethod::OpenedExisting)
                }
            }
        };

        let token = self.next();
        self.held
            .lock()
            .map_err(|e| anyhow::anyhow!("Mutex table poisoned: {}", e))?
            .insert(
                token,
                HeldMutex {
                    handle: handle.0 as usize,
                    owned: method == LeaseMethod::ClaimedNew,
                },
            );
        Ok((token, method))
    }

    fn release(&self, token: LeaseToken) -> Result<()> {
        let held = self
            .held
            .lock()
            .map_err(|e| anyhow::anyhow!("Mutex table poisoned: {}", e))?
            .remove(&token)
            .with_context(|| format!("Unknown lease token {}", token))?;

        let handle = HANDLE(held.handle as *mut std::ffi::c_void);
        unsafe {
            if held.owned {
                if let Err(e) = ReleaseMutex(handle) {
                    warn!("ReleaseMutex failed: {}", e);
                }
            }
            CloseHandle(handle)?;
        }
        Ok(())
    }

    fn create_keep_alive(&self) -> Result<LeaseToken> {
        let (tx, rx) = std::sync::mpsc::channel::<Result<u32>>();

        // The window lives on its own thread so it can pump messages and be destroyed there.
        let thread = std::thread::Builder::new()
            .name("bypass-keepalive".into())
            .spawn(move || unsafe {
                let hwnd = match create_hidden_window() {
                    Ok(hwnd) => hwnd,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                let _ = tx.send(Ok(GetCurrentThreadId()));

                let mut msg = MSG::default();
                while GetMessageW(&mut msg, HWND::default(), 0, 0).as_bool() {
                    let _ = TranslateMessage(&msg);
                    DispatchMessageW(&msg);
                }
                let _ = DestroyWindow(hwnd);
            })
            .context("Failed to spawn keep-alive thread")?;

        let thread_id = rx
            .recv()
            .context("Keep-alive thread exited before reporting")??;

        info!("Created hidden keep-alive window");
        let token = self.next();
        self.keep_alive
            .lock()
            .map_err(|e| anyhow::anyhow!("Keep-alive table poisoned: {}", e))?
            .insert(token, KeepAliveWindow { thread_id, thread });
        Ok(token)
    }

    fn destroy_keep_alive(&self, token: LeaseToken) -> Result<()> {
        let window = self
            .keep_alive
            .lock()
            .map_err(|e| anyhow::anyhow!("Keep-alive table poisoned: {}", e))?
            .remove(&token)
            .with_context(|| format!("Unknown keep-alive token {}", token))?;

        unsafe {
            PostThreadMessageW(window.thread_id, WM_QUIT, WPARAM(0), LPARAM(0))
                .context("Failed to signal keep-alive thread")?;
        }
        let _ = window.thread.join();
        Ok(())
    }
}

unsafe extern "system" fn keep_alive_wndproc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    DefWindowProcW(hwnd, msg, wparam, lparam)
}

unsafe fn create_hidden_window() -> Result<HWND> {
    let class_name = wide("MultiFleetKeepAlive");
    let title = wide("MultiFleet");
    let module = GetModuleHandleW(PCWSTR::null()).context("GetModuleHandleW failed")?;

    let wc = WNDCLASSW {
        lpfnWndProc: Some(keep_alive_wndproc),
        hInstance: module.into(),
        lpszClassName: PCWSTR::from_raw(class_name.as_ptr()),
        ..Default::default()
    };
    // re-registration after a previous activation fails harmlessly
    RegisterClassW(&wc);

    CreateWindowExW(
        WINDOW_EX_STYLE(0),
        PCWSTR::from_raw(class_name.as_ptr()),
        PCWSTR::from_raw(title.as_ptr()),
        WINDOW_STYLE(0),
        0,
        0,
        0,
        0,
        HWND_MESSAGE,
        HMENU::default(),
        module,
        None,
    )
    .context("CreateWindowExW failed")
}
