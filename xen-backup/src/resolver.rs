//! Disk identity across VM generations.
//!
//! Every snapshot or clone hands out fresh disk references, so the only
//! stable way to say "the same disk" across a full backup, a later snapshot
//! and a restored VM is the attachment slot (`userdevice`).

use crate::meta::{DiskAttachment, VmConfig};
use crate::utils::errors::{BackupError, Result};

/// The disk attached at `slot`, if any. Attachments without an image do not
/// count.
pub fn find_disk<'a>(config: &'a VmConfig, slot: &str) -> Option<&'a DiskAttachment> {
    config
        .vbds
        .iter()
        .find(|vbd| vbd.userdevice == slot && !vbd.vdi.is_empty())
}

/// Like [`find_disk`], failing with `DiskSlotNotFound` naming `config`'s VM.
pub fn resolve_disk<'a>(config: &'a VmConfig, slot: &str) -> Result<&'a DiskAttachment> {
    find_disk(config, slot).ok_or_else(|| BackupError::DiskSlotNotFound {
        slot: slot.to_string(),
        generation: if config.name_label.is_empty() {
            config.uuid.clone()
        } else {
            format!("{} ({})", config.name_label, config.uuid)
        },
    })
}
