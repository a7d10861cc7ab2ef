//! Native libvirt connection.
//!
//! Talks to libvirt through the `virt` bindings instead of the `virsh` CLI.
//! It requires the `libvirt` feature to be enabled and the system to have
//! libvirt installed.

#[cfg(feature = "libvirt")]
mod backend;

#[cfg(feature = "libvirt")]
pub use backend::LibvirtConnection;

/// Check if the native libvirt connection is compiled in.
pub fn is_available() -> bool {
    cfg!(feature = "libvirt")
}
