use std::{collections::HashMap, time::Duration};

use thiserror::Error;

use crate::{
    hardware::{
        AnalogInputs, ButtonInputs, Line, OutputLines, SenseChannel, SettleDelay, MAX_BUTTONS,
    },
    store::{Storage, STORAGE_SIZE},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("access of {len} bytes at offset {offset} is outside the {size}-byte region")]
pub struct OutOfBounds {
    pub offset: usize,
    pub len: usize,
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct MemoryStorage {
    bytes: Vec<u8>,
    commits: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::from_bytes(vec![0xFF; STORAGE_SIZE])
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes, commits: 0 }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), OutOfBounds> {
        match offset.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(()),
            _ => Err(OutOfBounds {
                offset,
                len,
                size: self.bytes.len(),
            }),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    type Error = OutOfBounds;

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.check(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Self::Error> {
        self.check(offset, data.len())?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Self::Error> {
        self.commits += 1;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MockBoard {
    levels: HashMap<Line, bool>,
    writes: Vec<(Line, bool)>,
    buttons: [bool; MAX_BUTTONS],
    adc: HashMap<SenseChannel, u16>,
    settles: Vec<Duration>,
}

impl MockBoard {
    pub fn new() -> Self {
        Self {
            levels: HashMap::new(),
            writes: Vec::new(),
            // Pull-ups: idle inputs read high.
            buttons: [true; MAX_BUTTONS],
            adc: HashMap::new(),
            settles: Vec::new(),
        }
    }

    pub fn level(&self, line: Line) -> Option<bool> {
        self.levels.get(&line).copied()
    }

    pub fn writes(&self) -> &[(Line, bool)] {
        &self.writes
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    pub fn press(&mut self, index: usize) {
        if let Some(level) = self.buttons.get_mut(index) {
            *level = false;
        }
    }

    pub fn release(&mut self, index: usize) {
        if let Some(level) = self.buttons.get_mut(index) {
            *level = true;
        }
    }

    pub fn set_adc(&mut self, channel: SenseChannel, raw: u16) {
        self.adc.insert(channel, raw);
    }

    pub fn settles(&self) -> &[Duration] {
        &self.settles
    }
}

impl Default for MockBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputLines for MockBoard {
    fn drive(&mut self, line: Line, high: bool) {
        self.levels.insert(line, high);
        self.writes.push((line, high));
    }
}

impl ButtonInputs for MockBoard {
    fn is_high(&mut self, index: usize) -> bool {
        self.buttons.get(index).copied().unwrap_or(true)
    }
}

impl AnalogInputs for MockBoard {
    fn read_raw(&mut self, channel: SenseChannel) -> u16 {
        self.adc.get(&channel).copied().unwrap_or(0)
    }
}

impl SettleDelay for MockBoard {
    fn settle(&mut self, duration: Duration) {
        self.settles.push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_rejects_out_of_range_access() {
        let mut storage = MemoryStorage::from_bytes(vec![0; 4]);
        let mut buf = [0_u8; 2];

        assert!(storage.read(2, &mut buf).is_ok());
        assert_eq!(
            storage.write(3, &[1, 2]),
            Err(OutOfBounds {
                offset: 3,
                len: 2,
                size: 4
            })
        );
    }
}
