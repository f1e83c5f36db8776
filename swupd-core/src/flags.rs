//! The 4-character flag string carried by every `FileRecord` (spec §3),
//! modelled as tagged enums per position and converted at the manifest
//! parse/write boundary rather than bit-packed chars kept in memory.

use crate::error::{Error, Result};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FileType {
	Unset,
	Regular,
	Directory,
	Link,
	Manifest,
	IterativeManifest,
}

impl FileType {
	fn to_char(self) -> char {
		match self {
			FileType::Unset => '.',
			FileType::Regular => 'F',
			FileType::Directory => 'D',
			FileType::Link => 'L',
			FileType::Manifest => 'M',
			FileType::IterativeManifest => 'I',
		}
	}

	fn from_char(c: u8) -> Result<Self> {
		Ok(match c {
			b'.' => FileType::Unset,
			b'F' => FileType::Regular,
			b'D' => FileType::Directory,
			b'L' => FileType::Link,
			b'M' => FileType::Manifest,
			b'I' => FileType::IterativeManifest,
			_ => return Err(Error::InvalidManifest(format!("bad type flag {:?}", c as char))),
		})
	}

	pub fn is_directory_like(self) -> bool {
		matches!(self, FileType::Manifest | FileType::IterativeManifest)
	}
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Status {
	Present,
	Deleted,
	Ghosted,
	Experimental,
}

impl Status {
	fn to_char(self) -> char {
		match self {
			Status::Present => '.',
			Status::Deleted => 'd',
			Status::Ghosted => 'g',
			Status::Experimental => 'e',
		}
	}

	fn from_char(c: u8) -> Result<Self> {
		Ok(match c {
			b'.' => Status::Present,
			b'd' => Status::Deleted,
			b'g' => Status::Ghosted,
			b'e' => Status::Experimental,
			_ => return Err(Error::InvalidManifest(format!("bad status flag {:?}", c as char))),
		})
	}

	pub fn is_deleted_like(self) -> bool {
		matches!(self, Status::Deleted | Status::Ghosted)
	}
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Modifier {
	Unset,
	Config,
	State,
	Boot,
	CpuV3,
	CpuV4,
	CpuV5,
}

impl Modifier {
	fn to_char(self) -> char {
		match self {
			Modifier::Unset => '.',
			Modifier::Config => 'C',
			Modifier::State => 's',
			Modifier::Boot => 'b',
			Modifier::CpuV3 => '3',
			Modifier::CpuV4 => '4',
			Modifier::CpuV5 => '5',
		}
	}

	fn from_char(c: u8) -> Result<Self> {
		Ok(match c {
			b'.' => Modifier::Unset,
			b'C' => Modifier::Config,
			b's' => Modifier::State,
			b'b' => Modifier::Boot,
			b'3' => Modifier::CpuV3,
			b'4' => Modifier::CpuV4,
			b'5' => Modifier::CpuV5,
			_ => return Err(Error::InvalidManifest(format!("bad modifier flag {:?}", c as char))),
		})
	}
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Misc {
	Unset,
	MixOrigin,
	/// historical rename marker; still parsed, never written by this format set
	RenameLegacy,
}

impl Misc {
	fn to_char(self) -> char {
		match self {
			Misc::Unset => '.',
			Misc::MixOrigin => 'm',
			Misc::RenameLegacy => 'r',
		}
	}

	fn from_char(c: u8) -> Result<Self> {
		Ok(match c {
			b'.' => Misc::Unset,
			b'm' => Misc::MixOrigin,
			b'r' => Misc::RenameLegacy,
			_ => return Err(Error::InvalidManifest(format!("bad misc flag {:?}", c as char))),
		})
	}

	pub fn is_rename_marker(self) -> bool {
		matches!(self, Misc::MixOrigin | Misc::RenameLegacy)
	}
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Flags {
	pub file_type: FileType,
	pub status: Status,
	pub modifier: Modifier,
	pub misc: Misc,
}

impl Flags {
	pub const fn unset() -> Self {
		Self { file_type: FileType::Unset, status: Status::Present, modifier: Modifier::Unset, misc: Misc::Unset }
	}

	pub fn deleted() -> Self {
		Self { file_type: FileType::Unset, status: Status::Deleted, modifier: Modifier::Unset, misc: Misc::Unset }
	}

	pub fn to_string4(self) -> String {
		let mut s = String::with_capacity(4);
		s.push(self.file_type.to_char());
		s.push(self.status.to_char());
		s.push(self.modifier.to_char());
		s.push(self.misc.to_char());
		s
	}

	pub fn parse(s: &str) -> Result<Self> {
		let b = s.as_bytes();
		if b.len() != 4 {
			return Err(Error::InvalidManifest(format!("flags must be 4 chars, got {s:?}")));
		}
		Ok(Self {
			file_type: FileType::from_char(b[0])?,
			status: Status::from_char(b[1])?,
			modifier: Modifier::from_char(b[2])?,
			misc: Misc::from_char(b[3])?,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_every_combination_used_in_practice() {
		for s in ["F...", "D.C.", "Ld..", "Mg3.", "I.bm", "..4r", ".e5."] {
			let parsed = Flags::parse(s).unwrap();
			assert_eq!(parsed.to_string4(), s);
		}
	}

	#[test]
	fn rejects_wrong_length_and_unknown_chars() {
		assert!(Flags::parse("F..").is_err());
		assert!(Flags::parse("F....").is_err());
		assert!(Flags::parse("X...").is_err());
	}

	#[test]
	fn deleted_default_has_zero_type_and_unset_modifier() {
		let f = Flags::deleted();
		assert_eq!(f.file_type, FileType::Unset);
		assert_eq!(f.status, Status::Deleted);
	}
}
