use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle, RawWindowHandle};
use spark::{vk, Instance, InstanceExtensions, Result};
use winit::window::Window;

pub fn enable_extensions(window: &Window, extensions: &mut InstanceExtensions) {
    match window.raw_window_handle() {
        #[cfg(target_os = "linux")]
        RawWindowHandle::Xlib(..) => extensions.enable_khr_xlib_surface(),

        #[cfg(target_os = "windows")]
        RawWindowHandle::Win32(..) => extensions.enable_khr_win32_surface(),

        _ => unimplemented!(),
    }
}

pub fn create(instance: &Instance, window: &Window) -> Result<vk::SurfaceKHR> {
    match (window.raw_display_handle(), window.raw_window_handle()) {
        #[cfg(target_os = "linux")]
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let create_info = vk::XlibSurfaceCreateInfoKHR {
                dpy: display.display as _,
                window: handle.window,
                ..Default::default()
            };
            unsafe { instance.create_xlib_surface_khr(&create_info, None) }
        }

        #[cfg(target_os = "windows")]
        (_, RawWindowHandle::Win32(handle)) => {
            let create_info = vk::Win32SurfaceCreateInfoKHR {
                hwnd: handle.hwnd,
                ..Default::default()
            };
            unsafe { instance.create_win32_surface_khr(&create_info, None) }
        }

        _ => unimplemented!(),
    }
}
