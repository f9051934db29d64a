//! Export resolution over mapped PE images

use hwbp_common::{Error, Result};

const DOS_MAGIC: u16 = 0x5A4D;
const NT_SIGNATURE: u32 = 0x0000_4550;
const PE32_MAGIC: u16 = 0x10B;
const PE32_PLUS_MAGIC: u16 = 0x20B;

/// Offset of `e_lfanew` in the DOS header
const E_LFANEW_OFFSET: usize = 0x3C;
/// Signature plus IMAGE_FILE_HEADER
const OPTIONAL_HEADER_OFFSET: usize = 4 + 20;
/// Offset of the data directory array inside each optional header flavour
const PE32_DATA_DIRECTORY_OFFSET: usize = 96;
const PE32_PLUS_DATA_DIRECTORY_OFFSET: usize = 112;

#[repr(C)]
#[derive(Clone, Copy)]
struct DataDirectory {
    virtual_address: u32,
    size: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct ExportDirectory {
    characteristics: u32,
    time_date_stamp: u32,
    major_version: u16,
    minor_version: u16,
    name: u32,
    base: u32,
    number_of_functions: u32,
    number_of_names: u32,
    address_of_functions: u32,
    address_of_names: u32,
    address_of_name_ordinals: u32,
}

#[inline]
unsafe fn read<T: Copy>(base: usize, offset: usize) -> T {
    std::ptr::read_unaligned((base + offset) as *const T)
}

/// Compare the NUL-terminated string at `address` with `name`.
unsafe fn name_matches(address: usize, name: &[u8]) -> bool {
    for (i, &expected) in name.iter().enumerate() {
        if read::<u8>(address, i) != expected {
            return false;
        }
    }
    read::<u8>(address, name.len()) == 0
}

unsafe fn export_directory(base: usize) -> Option<DataDirectory> {
    if read::<u16>(base, 0) != DOS_MAGIC {
        return None;
    }
    let nt = base + read::<i32>(base, E_LFANEW_OFFSET) as usize;
    if read::<u32>(nt, 0) != NT_SIGNATURE {
        return None;
    }

    let optional = nt + OPTIONAL_HEADER_OFFSET;
    let directories = match read::<u16>(optional, 0) {
        PE32_MAGIC => optional + PE32_DATA_DIRECTORY_OFFSET,
        PE32_PLUS_MAGIC => optional + PE32_PLUS_DATA_DIRECTORY_OFFSET,
        _ => return None,
    };

    // Entry 0 is IMAGE_DIRECTORY_ENTRY_EXPORT
    let dir = read::<DataDirectory>(directories, 0);
    (dir.virtual_address != 0 && dir.size != 0).then_some(dir)
}

/// Address of the export `name` in the image mapped at `base`.
///
/// Forwarded exports resolve to `None`: their RVA names another module's
/// export rather than code in this one.
///
/// # Safety
/// `base` must be the base of a mapped PE image.
pub unsafe fn find_export(base: usize, name: &str) -> Option<usize> {
    let dir_entry = export_directory(base)?;
    let dir = read::<ExportDirectory>(base, dir_entry.virtual_address as usize);

    let functions = base + dir.address_of_functions as usize;
    let names = base + dir.address_of_names as usize;
    let ordinals = base + dir.address_of_name_ordinals as usize;

    let forward_range =
        dir_entry.virtual_address..dir_entry.virtual_address.saturating_add(dir_entry.size);

    for i in 0..dir.number_of_names as usize {
        let name_rva = read::<u32>(names, i * 4);
        if !name_matches(base + name_rva as usize, name.as_bytes()) {
            continue;
        }

        let index = read::<u16>(ordinals, i * 2) as usize;
        if index >= dir.number_of_functions as usize {
            return None;
        }
        let rva = read::<u32>(functions, index * 4);
        if rva == 0 || forward_range.contains(&rva) {
            return None;
        }
        return Some(base + rva as usize);
    }
    None
}

/// Base address of an already loaded module
#[cfg(windows)]
pub fn module_base(module: &str) -> Result<usize> {
    use windows::core::PCWSTR;
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;

    let wide: Vec<u16> = module.encode_utf16().chain(std::iter::once(0)).collect();
    unsafe {
        let handle = GetModuleHandleW(PCWSTR(wide.as_ptr()))
            .map_err(|_| Error::ModuleNotFound(module.to_string()))?;
        Ok(handle.0 as usize)
    }
}

#[cfg(not(windows))]
pub fn module_base(module: &str) -> Result<usize> {
    Err(Error::Unsupported(format!("module lookup for {}", module)))
}

/// Resolve `module!export` in the current process.
pub fn resolve_export(module: &str, export: &str) -> Result<usize> {
    let base = module_base(module)?;
    unsafe { find_export(base, export) }.ok_or_else(|| Error::ExportNotFound {
        module: module.to_string(),
        export: export.to_string(),
    })
}
