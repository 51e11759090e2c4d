//! Linux capabilities granted to build steps.

use std::collections::HashSet;

use oci_spec::runtime::Capability;

/// The conventional container default set.
///
/// Enough to run package managers and `chown` files in the image, nothing
/// that reaches outside the sandbox.
pub fn default_capabilities() -> HashSet<Capability> {
    [
        Capability::Chown,
        Capability::DacOverride,
        Capability::Fsetid,
        Capability::Fowner,
        Capability::Mknod,
        Capability::NetRaw,
        Capability::Setgid,
        Capability::Setuid,
        Capability::Setfcap,
        Capability::Setpcap,
        Capability::NetBindService,
        Capability::SysChroot,
        Capability::Kill,
        Capability::AuditWrite,
    ]
    .into_iter()
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capabilities() {
        let caps = default_capabilities();
        assert_eq!(caps.len(), 14);
        assert!(caps.contains(&Capability::Chown));
        assert!(!caps.contains(&Capability::SysAdmin));
    }
}
