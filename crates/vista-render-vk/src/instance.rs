// SPDX-License-Identifier: CEPL-1.0
//! API instance, diagnostic hook, and presentation-surface binding.
//!
//! STRICT ORDER:
//! 1) Create the instance with the WSI extensions the surface source needs
//! 2) Create surfaces FROM THIS INSTANCE
//! 3) (Later, in the selector) query devices/queues AGAINST those surfaces
//!
//! Teardown runs the other way round: surfaces and devices hold an `Arc` to
//! the [`InstanceContext`], so the instance is always destroyed last.
use anyhow::{Context, Result};
use ash::ext::{debug_utils, headless_surface};
use ash::khr::surface;
use ash::{vk, Entry, Instance};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{RenderError, VkResultExt};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Where presentation surfaces for this instance come from.
#[derive(Clone, Copy, Debug)]
pub enum SurfaceSource {
    /// A window-system display; surfaces wrap native windows on it.
    Display(RawDisplayHandle),
    /// Off-screen presentable surfaces (`VK_EXT_headless_surface`).
    Headless,
}

#[derive(Clone, Debug)]
pub struct SelectorOptions {
    pub application_name: String,
    /// Enable the Khronos validation layer and route its messages to `tracing`.
    pub validation: bool,
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            application_name: "vista".to_owned(),
            validation: cfg!(debug_assertions),
        }
    }
}

pub struct InstanceContext {
    entry: Entry,
    instance: Instance,
    surface_loader: surface::Instance,
    source: SurfaceSource,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl InstanceContext {
    pub fn new(source: SurfaceSource, options: &SelectorOptions) -> Result<Arc<Self>> {
        // SAFETY: loading the Vulkan library runs its initialisation code;
        // nothing else in this process depends on it being absent.
        let entry =
            unsafe { Entry::load() }.map_err(|e| RenderError::Loader(e.to_string()))?;

        let available_exts = unsafe { entry.enumerate_instance_extension_properties(None) }
            .vk_call("vkEnumerateInstanceExtensionProperties")?;
        let has_ext = |name: &CStr| {
            available_exts
                .iter()
                .any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == name))
        };

        let mut extensions: Vec<*const c_char> = match source {
            SurfaceSource::Display(display) => ash_window::enumerate_required_extensions(display)
                .vk_call("enumerate_required_extensions")?
                .to_vec(),
            SurfaceSource::Headless => {
                vec![surface::NAME.as_ptr(), headless_surface::NAME.as_ptr()]
            }
        };

        let mut layers: Vec<*const c_char> = Vec::new();
        let mut with_debug = false;
        if options.validation {
            let available_layers = unsafe { entry.enumerate_instance_layer_properties() }
                .vk_call("vkEnumerateInstanceLayerProperties")?;
            let has_layer = available_layers
                .iter()
                .any(|l| l.layer_name_as_c_str().is_ok_and(|n| n == VALIDATION_LAYER));
            if has_layer {
                layers.push(VALIDATION_LAYER.as_ptr());
            } else {
                warn!("validation requested but {VALIDATION_LAYER:?} is not installed");
            }
            if has_ext(debug_utils::NAME) {
                extensions.push(debug_utils::NAME.as_ptr());
                with_debug = true;
            } else {
                warn!("validation requested but {:?} is not available", debug_utils::NAME);
            }
        }

        let app_name = CString::new(options.application_name.as_str())
            .unwrap_or_else(|_| CString::from(c"vista"));
        let app_info = vk::ApplicationInfo {
            s_type: vk::StructureType::APPLICATION_INFO,
            p_application_name: app_name.as_ptr(),
            application_version: vk::make_api_version(0, 0, 1, 0),
            p_engine_name: c"vista".as_ptr(),
            engine_version: vk::make_api_version(0, 0, 1, 0),
            api_version: vk::API_VERSION_1_1,
            ..Default::default()
        };
        let create_info = vk::InstanceCreateInfo {
            s_type: vk::StructureType::INSTANCE_CREATE_INFO,
            p_application_info: &app_info,
            enabled_layer_count: layers.len() as u32,
            pp_enabled_layer_names: layers.as_ptr(),
            enabled_extension_count: extensions.len() as u32,
            pp_enabled_extension_names: extensions.as_ptr(),
            ..Default::default()
        };
        // SAFETY: every pointer in create_info refers to locals that outlive the call.
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .vk_call("vkCreateInstance")?;
        debug!(
            "instance created ({} extensions, {} layers)",
            extensions.len(),
            layers.len()
        );

        let debug = if with_debug {
            match create_debug_messenger(&entry, &instance) {
                Ok(pair) => Some(pair),
                Err(e) => {
                    warn!("debug messenger unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        Ok(Arc::new(Self {
            entry,
            instance,
            surface_loader,
            source,
            debug,
        }))
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn surface_loader(&self) -> &surface::Instance {
        &self.surface_loader
    }
}

impl Drop for InstanceContext {
    fn drop(&mut self) {
        // SAFETY: every child object holds an Arc to this context, so by the
        // time it drops nothing created from the instance is still alive.
        unsafe {
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader hands us a valid callback-data struct for the
    // duration of the call.
    let msg = unsafe { (*data).message_as_c_str() }
        .map(CStr::to_string_lossy)
        .unwrap_or_default();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        tracing::info!(target: "vulkan", "{msg}");
    } else {
        tracing::debug!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Result<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    // SAFETY: ci is fully initialised; the callback is a plain function.
    let messenger = unsafe { loader.create_debug_utils_messenger(&ci, None) }
        .vk_call("vkCreateDebugUtilsMessengerEXT")?;
    info!("debug messenger attached");
    Ok((loader, messenger))
}

/// A presentation surface, destroyed on drop through the instance that made it.
pub struct PresentSurface {
    handle: vk::SurfaceKHR,
    context: Arc<InstanceContext>,
}

impl PresentSurface {
    pub fn from_window(context: &Arc<InstanceContext>, window: RawWindowHandle) -> Result<Self> {
        let display = match context.source {
            SurfaceSource::Display(display) => display,
            SurfaceSource::Headless => {
                anyhow::bail!(RenderError::WindowHandle(
                    "instance was created for headless surfaces".to_owned()
                ))
            }
        };
        // SAFETY: the caller's window outlives the surface (the shell keeps
        // the window until the renderer is dropped).
        let handle = unsafe {
            ash_window::create_surface(&context.entry, &context.instance, display, window, None)
        }
        .vk_call("ash_window::create_surface")?;
        Ok(Self {
            handle,
            context: Arc::clone(context),
        })
    }

    pub fn headless(context: &Arc<InstanceContext>) -> Result<Self> {
        if !matches!(context.source, SurfaceSource::Headless) {
            anyhow::bail!(RenderError::WindowHandle(
                "instance was created for a window-system display".to_owned()
            ));
        }
        let loader = headless_surface::Instance::new(&context.entry, &context.instance);
        let ci = vk::HeadlessSurfaceCreateInfoEXT {
            s_type: vk::StructureType::HEADLESS_SURFACE_CREATE_INFO_EXT,
            ..Default::default()
        };
        // SAFETY: ci has no pointers; the extension was enabled at instance creation.
        let handle = unsafe { loader.create_headless_surface(&ci, None) }
            .vk_call("vkCreateHeadlessSurfaceEXT")
            .context("creating headless surface")?;
        Ok(Self {
            handle,
            context: Arc::clone(context),
        })
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }
}

impl Drop for PresentSurface {
    fn drop(&mut self) {
        // SAFETY: the owning renderer destroys its swapchain before this runs.
        unsafe {
            self.context
                .surface_loader
                .destroy_surface(self.handle, None)
        };
    }
}
