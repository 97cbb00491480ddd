// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

pub type VkResult<T> = Result<T, VkError>;

#[derive(Debug, Error)]
pub enum VkError {
    #[error("instance creation failed: {0}")]
    InstanceCreation(String),
    #[error("surface creation failed: {0}")]
    SurfaceCreation(String),
    #[error("no suitable physical device: {0}")]
    NoSuitableDevice(String),
    #[error("swapchain out of date ({call})")]
    SwapchainOutOfDate { call: &'static str },
    #[error("swapchain suboptimal ({call})")]
    SwapchainSuboptimal { call: &'static str },
    #[error("device lost in {call}")]
    DeviceLost { call: &'static str },
    #[error("host allocation failed in {call}")]
    HostAllocation { call: &'static str },
    #[error("upload failed in {call}: {result:?}")]
    Upload { call: &'static str, result: vk::Result },
    #[error("{call} failed: {result:?}")]
    Vulkan { call: &'static str, result: vk::Result },
    #[error("shader {path:?}: {reason}")]
    Shader { path: PathBuf, reason: String },
    #[error("config: {0}")]
    Config(String),
    #[error("invalid renderer state: {0}")]
    InvalidState(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VkError {
    /// Maps a raw result to its typed kind, tagging the failing entry point.
    pub fn from_result(call: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => VkError::SwapchainOutOfDate { call },
            vk::Result::SUBOPTIMAL_KHR => VkError::SwapchainSuboptimal { call },
            vk::Result::ERROR_DEVICE_LOST => VkError::DeviceLost { call },
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => VkError::HostAllocation { call },
            result => VkError::Vulkan { call, result },
        }
    }

    /// Out-of-date and suboptimal swapchains are recovered in place; everything
    /// else ends the renderer.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            VkError::SwapchainOutOfDate { .. } | VkError::SwapchainSuboptimal { .. }
        )
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(self, VkError::DeviceLost { .. })
    }

    /// Re-tags device-memory exhaustion during transfers as an upload failure.
    pub(crate) fn into_upload(self) -> Self {
        match self {
            VkError::Vulkan { call, result } => VkError::Upload { call, result },
            other => other,
        }
    }
}

/// Attach a call-site name to a raw `ash` result.
pub trait VkResultExt<T> {
    fn at(self, call: &'static str) -> VkResult<T>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn at(self, call: &'static str) -> VkResult<T> {
        self.map_err(|r| VkError::from_result(call, r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_map_to_kinds() {
        assert!(matches!(
            VkError::from_result("vkAcquireNextImageKHR", vk::Result::ERROR_OUT_OF_DATE_KHR),
            VkError::SwapchainOutOfDate { call: "vkAcquireNextImageKHR" }
        ));
        assert!(VkError::from_result("vkQueueSubmit2", vk::Result::ERROR_DEVICE_LOST).is_device_lost());
        assert!(matches!(
            VkError::from_result("vkAllocateMemory", vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            VkError::HostAllocation { .. }
        ));
    }

    #[test]
    fn only_swapchain_staleness_is_recoverable() {
        assert!(!VkError::SwapchainOutOfDate { call: "x" }.is_fatal());
        assert!(!VkError::SwapchainSuboptimal { call: "x" }.is_fatal());
        assert!(VkError::DeviceLost { call: "x" }.is_fatal());
        assert!(VkError::NoSuitableDevice("none".into()).is_fatal());
    }

    #[test]
    fn message_names_call_site_and_result() {
        let err: VkResult<()> = Err(vk::Result::ERROR_INITIALIZATION_FAILED).at("vkCreateDevice");
        let msg = err.unwrap_err().to_string();
        assert!(msg.contains("vkCreateDevice"));
        assert!(msg.contains("ERROR_INITIALIZATION_FAILED"));
    }

    #[test]
    fn device_memory_exhaustion_becomes_upload_failure() {
        let e = VkError::from_result("vkAllocateMemory", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).into_upload();
        assert!(matches!(e, VkError::Upload { result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY, .. }));
    }
}
