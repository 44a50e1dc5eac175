use std::io::Write;

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use num_bigint::BigUint;
use uuid::Uuid;

use super::{fixed_be, Capability, FsKey, KeyError};
use crate::view::Region;

/// Key-checkpoint file signature.
pub const CHECKPOINT_MAGIC: &[u8; 8] = b"KSHHRHLP";
/// Size of the fixed little-endian checkpoint header.
pub const CHECKPOINT_HEADER_SIZE: u64 = 0x58;

impl FsKey {
    /// Load the public (checkpoint) form of a key.
    ///
    /// Layout: little-endian header (magic, flags, machine and boot id,
    /// header size, window start, interval, secpar, state size), then at
    /// `header_size` a big-endian block `code:u16 ‖ n ‖ state ‖ epoch:u64`
    /// with `secpar = 16·(code+1)` bits per bignum.
    pub fn from_checkpoint(bytes: &[u8]) -> Result<FsKey, KeyError> {
        let region = Region::from_bytes(bytes.to_vec());
        let mut bb = region.view();

        if bb.read_bytes(&region, 8)? != CHECKPOINT_MAGIC {
            return Err(KeyError::BadCheckpointMagic);
        }
        let _compatible = bb.read_u32(&region)?;
        let incompatible = bb.read_u32(&region)?;
        if incompatible != 0 {
            return Err(KeyError::UnsupportedCheckpoint(format!(
                "incompatible flags {incompatible:#x}"
            )));
        }
        let _machine_id = bb.read_uuid(&region)?;
        let _boot_id = bb.read_uuid(&region)?;
        let header_size = bb.read_u64(&region)?;
        if header_size < CHECKPOINT_HEADER_SIZE {
            return Err(KeyError::UnsupportedCheckpoint(format!("header size {header_size:#x}")));
        }
        let start_usec = bb.read_u64(&region)?;
        let interval_usec = bb.read_u64(&region)?;
        if interval_usec == 0 {
            return Err(KeyError::UnsupportedCheckpoint("zero interval".into()));
        }
        bb.skip(8)?; // secpar + reserved; the state block is authoritative
        let state_size = bb.read_u64(&region)?;
        let declared = header_size.saturating_add(state_size);
        if declared != region.len() {
            return Err(KeyError::CheckpointSizeMismatch { declared, actual: region.len() });
        }

        bb.set_position(header_size)?;
        let code = bb.read_u16_be(&region)?;
        let secpar = 16 * (u32::from(code) + 1);
        if secpar > u32::from(u16::MAX) {
            return Err(KeyError::UnsupportedCheckpoint(format!("secpar code {code}")));
        }
        let width = u64::from(secpar / 8);
        let modulus = BigUint::from_bytes_be(bb.read_bytes(&region, width)?);
        let state = BigUint::from_bytes_be(bb.read_bytes(&region, width)?);
        let epoch = bb.read_u64_be(&region)?;

        Ok(FsKey {
            modulus,
            state,
            epoch,
            secpar: secpar as u16,
            start_usec,
            interval_usec,
            capability: Capability::Checkpoint,
        })
    }

    /// Serialise the checkpoint for `epoch` (what the daemon keeps on disk
    /// once epoch `epoch - 1` has been sealed).
    pub fn to_checkpoint(&self, epoch: u64, machine_id: Uuid, boot_id: Uuid) -> Result<Vec<u8>, KeyError> {
        let state = self.state(epoch)?;
        let width = (self.secpar / 8) as usize;
        let state_size = (2 + 2 * width + 8) as u64;

        let mut out = Vec::with_capacity(CHECKPOINT_HEADER_SIZE as usize + state_size as usize);
        write_checkpoint(&mut out, self, &state, epoch, machine_id, boot_id, state_size)
            .map_err(|e| KeyError::UnsupportedCheckpoint(e.to_string()))?;
        Ok(out)
    }
}

fn write_checkpoint<W: Write>(
    w: &mut W,
    key: &FsKey,
    state: &BigUint,
    epoch: u64,
    machine_id: Uuid,
    boot_id: Uuid,
    state_size: u64,
) -> std::io::Result<()> {
    let width = (key.secpar / 8) as usize;
    w.write_all(CHECKPOINT_MAGIC)?;
    w.write_u32::<LittleEndian>(0)?;
    w.write_u32::<LittleEndian>(0)?;
    w.write_all(machine_id.as_bytes())?;
    w.write_all(boot_id.as_bytes())?;
    w.write_u64::<LittleEndian>(CHECKPOINT_HEADER_SIZE)?;
    w.write_u64::<LittleEndian>(key.start_usec)?;
    w.write_u64::<LittleEndian>(key.interval_usec)?;
    w.write_u16::<LittleEndian>(key.secpar)?;
    w.write_all(&[0u8; 6])?;
    w.write_u64::<LittleEndian>(state_size)?;

    w.write_u16::<BigEndian>(key.secpar / 16 - 1)?;
    w.write_all(&fixed_be(&key.modulus, width))?;
    w.write_all(&fixed_be(state, width))?;
    w.write_u64::<BigEndian>(epoch)?;
    Ok(())
}
