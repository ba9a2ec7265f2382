//! Disk image builder
//!
//! boot2docker formats its data disk on first boot when the disk starts with
//! a magic marker, and unpacks the tar stream that follows into the docker
//! user's home. That is how the SSH key reaches a fresh VM.

use crate::error::{Result, VirtualBoxError};
use crate::vboxmanage::VBoxManage;
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Marker recognized by the boot2docker automount logic
pub const FORMAT_ME_MAGIC: &[u8] = b"boot2docker, please format-me";

const ZERO_BLOCK_SIZE: usize = 32 * 1024;

/// Build the disk payload: magic marker followed by a tar stream holding the
/// public key as `.ssh/authorized_keys` and `.ssh/authorized_keys2`
pub fn boot2docker_payload(public_key: &[u8]) -> Result<Vec<u8>> {
    let mut payload = FORMAT_ME_MAGIC.to_vec();
    {
        let mut tar = tar::Builder::new(&mut payload);

        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_path(".ssh")?;
        dir.set_size(0);
        dir.set_mode(0o700);
        dir.set_cksum();
        tar.append(&dir, std::io::empty())?;

        for name in [".ssh/authorized_keys", ".ssh/authorized_keys2"] {
            let mut header = tar::Header::new_gnu();
            header.set_path(name)?;
            header.set_size(public_key.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append(&header, public_key)?;
        }

        tar.finish()?;
    }
    Ok(payload)
}

/// Size of a disk of `size_mb` megabytes in bytes
pub fn image_size(size_mb: u64) -> Result<u64> {
    size_mb
        .checked_mul(1024 * 1024)
        .ok_or_else(|| VirtualBoxError::Disk(format!("disk size of {} MB is too large", size_mb)))
}

/// Write `payload` followed by zeros until exactly `size_mb` megabytes
///
/// Returns the number of bytes written.
pub async fn write_raw_image<W>(writer: &mut W, size_mb: u64, payload: &[u8]) -> Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let target = image_size(size_mb)?;
    if payload.len() as u64 > target {
        return Err(VirtualBoxError::Disk(format!(
            "payload of {} bytes does not fit a {} MB disk",
            payload.len(),
            size_mb
        )));
    }

    writer.write_all(payload).await?;
    let mut written = payload.len() as u64;

    let zeros = vec![0u8; ZERO_BLOCK_SIZE];
    while written < target {
        let chunk = (target - written).min(ZERO_BLOCK_SIZE as u64) as usize;
        writer.write_all(&zeros[..chunk]).await?;
        written += chunk as u64;
    }
    writer.flush().await?;

    if written != target {
        return Err(VirtualBoxError::Disk(format!(
            "wrote {} bytes, expected {}",
            written, target
        )));
    }
    Ok(written)
}

/// Stream a raw image into `VBoxManage convertfromraw` to produce a VMDK
pub async fn create_disk_image(
    vbox: &VBoxManage,
    dest: &Path,
    size_mb: u64,
    payload: &[u8],
) -> Result<()> {
    let bytes = image_size(size_mb)?.to_string();
    let dest_arg = dest.display().to_string();
    let mut child = vbox
        .spawn_piped(&[
            "convertfromraw",
            "stdin",
            dest_arg.as_str(),
            bytes.as_str(),
            "--format",
            "VMDK",
        ])
        .await?;

    let written = write_raw_image(&mut child.stdin, size_mb, payload).await;
    let shutdown = child.stdin.shutdown().await;
    drop(child.stdin);

    // An early exit shows up as a broken pipe; the exit status says why
    let output = child.exit.await?;
    if !output.success {
        return Err(VirtualBoxError::Command {
            program: vbox.program().display().to_string(),
            stderr: output.stderr.trim().to_string(),
        });
    }
    let written = written?;
    shutdown?;

    tracing::info!(path = %dest.display(), bytes = written, "Created disk image");
    Ok(())
}
