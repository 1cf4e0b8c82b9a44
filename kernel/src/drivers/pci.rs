//! PCI configuration-space access and a flat bus scan.
//!
//! Just enough of the bus walk to find the virtio function: config dword
//! reads/writes through the 0xCF8/0xCFC mechanism and an enumeration
//! callback over every present function.

/// One discovered PCI function.
#[derive(Debug, Clone, Copy)]
pub struct PciDevice {
    pub bus: u8,
    pub slot: u8,
    pub func: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
}

const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

fn config_address(bus: u8, slot: u8, func: u8, offset: u8) -> u32 {
    0x8000_0000
        | (bus as u32) << 16
        | (slot as u32) << 11
        | (func as u32) << 8
        | (offset as u32 & 0xFC)
}

/// Read a config-space dword.
pub fn read_u32(bus: u8, slot: u8, func: u8, offset: u8) -> u32 {
    #[cfg(target_os = "none")]
    {
        use x86_64::instructions::port::Port;
        let mut addr: Port<u32> = Port::new(CONFIG_ADDRESS);
        let mut data: Port<u32> = Port::new(CONFIG_DATA);
        // SAFETY: standard PCI configuration mechanism #1.
        unsafe {
            addr.write(config_address(bus, slot, func, offset));
            data.read()
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = (bus, slot, func, offset);
        0xFFFF_FFFF
    }
}

/// Write a config-space dword.
pub fn write_u32(bus: u8, slot: u8, func: u8, offset: u8, value: u32) {
    #[cfg(target_os = "none")]
    {
        use x86_64::instructions::port::Port;
        let mut addr: Port<u32> = Port::new(CONFIG_ADDRESS);
        let mut data: Port<u32> = Port::new(CONFIG_DATA);
        // SAFETY: standard PCI configuration mechanism #1.
        unsafe {
            addr.write(config_address(bus, slot, func, offset));
            data.write(value);
        }
    }
    #[cfg(not(target_os = "none"))]
    let _ = (bus, slot, func, offset, value);
}

/// Read a config-space word.
pub fn read_u16(bus: u8, slot: u8, func: u8, offset: u8) -> u16 {
    let dword = read_u32(bus, slot, func, offset & 0xFC);
    (dword >> ((offset & 2) * 8)) as u16
}

/// Write a config-space word (read-modify-write of the containing dword).
pub fn write_u16(bus: u8, slot: u8, func: u8, offset: u8, value: u16) {
    let aligned = offset & 0xFC;
    let shift = (offset & 2) * 8;
    let dword = read_u32(bus, slot, func, aligned);
    let merged = (dword & !(0xFFFF << shift)) | (value as u32) << shift;
    write_u32(bus, slot, func, aligned, merged);
}

/// Enumerate every present function on every bus.
pub fn scan(mut callback: impl FnMut(&PciDevice)) {
    for bus in 0..=255u8 {
        for slot in 0..32u8 {
            for func in 0..8u8 {
                let vendor_id = read_u16(bus, slot, func, 0x00);
                if vendor_id == 0xFFFF {
                    if func == 0 {
                        break; // no device in this slot at all
                    }
                    continue;
                }
                let device_id = read_u16(bus, slot, func, 0x02);
                let class_dword = read_u32(bus, slot, func, 0x08);
                let device = PciDevice {
                    bus,
                    slot,
                    func,
                    vendor_id,
                    device_id,
                    class: (class_dword >> 24) as u8,
                    subclass: (class_dword >> 16) as u8,
                };
                callback(&device);

                // Single-function devices only occupy function 0.
                if func == 0 {
                    let header_type = (read_u32(bus, slot, func, 0x0C) >> 16) as u8;
                    if header_type & 0x80 == 0 {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_address_packs_fields() {
        let addr = config_address(1, 2, 3, 0x13);
        assert_eq!(addr & 0x8000_0000, 0x8000_0000);
        assert_eq!((addr >> 16) & 0xFF, 1);
        assert_eq!((addr >> 11) & 0x1F, 2);
        assert_eq!((addr >> 8) & 0x7, 3);
        // Offsets are dword-aligned in the address register.
        assert_eq!(addr & 0xFF, 0x10);
    }
}
