use std::fmt::{Debug, Display, Formatter};

use crate::error::Error;

/// 128-bit interface identifier, binary compatible with the native `GUID`
/// struct. Both sides of the interop must declare the same value for
/// QueryInterface to succeed.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const NIL: Guid = Guid {
        data1: 0,
        data2: 0,
        data3: 0,
        data4: [0; 8],
    };

    pub const fn from_fields(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    /// Parse the standard hyphenated hex form,
    /// `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let bad = || Error::Contract {
            context: s.to_string(),
            detail: "not a valid interface id, expected xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx"
                .to_string(),
        };

        let groups: Vec<&str> = s.split('-').collect();
        let [g0, g1, g2, g3, g4] = groups[..] else {
            return Err(bad());
        };
        if g0.len() != 8 || g1.len() != 4 || g2.len() != 4 || g3.len() != 4 || g4.len() != 12 {
            return Err(bad());
        }

        let data1 = u32::from_str_radix(g0, 16).map_err(|_| bad())?;
        let data2 = u16::from_str_radix(g1, 16).map_err(|_| bad())?;
        let data3 = u16::from_str_radix(g2, 16).map_err(|_| bad())?;

        let mut data4 = [0u8; 8];
        let tail: String = format!("{g3}{g4}");
        for (i, chunk) in tail.as_bytes().chunks_exact(2).enumerate() {
            let chunk = std::str::from_utf8(chunk).map_err(|_| bad())?;
            data4[i] = u8::from_str_radix(chunk, 16).map_err(|_| bad())?;
        }

        Ok(Self {
            data1,
            data2,
            data3,
            data4,
        })
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7],
        )
    }
}

impl Debug for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Guid({self})")
    }
}
