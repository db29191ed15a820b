// Copyright 2024 fstransform contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Extent-file persistence (spec §4.7, §6, component C9): the plain-text
//! wire format used to save the loop-file and free-space extent vectors
//! into the job directory, and to reload them on resume.
//!
//! ```text
//! length <file_size>
//! physical	logical	length	user_data
//! <p0>	<l0>	<len0>	<tag0>
//! ...
//! ```

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::{EngineError, ErrorKind, Result};
use crate::extent::{Extent, Tag};
use crate::vector::ExtentVector;

fn tag_to_code(tag: Tag) -> u8 {
    match tag {
        Tag::Device => 0,
        Tag::LoopFile => 1,
        Tag::ZeroFile => 2,
        Tag::Storage => 3,
        Tag::Default => 4,
    }
}

fn code_to_tag(code: u8) -> Result<Tag> {
    match code {
        0 => Ok(Tag::Device),
        1 => Ok(Tag::LoopFile),
        2 => Ok(Tag::ZeroFile),
        3 => Ok(Tag::Storage),
        4 => Ok(Tag::Default),
        other => Err(EngineError::new(ErrorKind::InvalidInput, format!("unrecognized user_data tag code {other}"))),
    }
}

/// Write `extents` to `path` in the wire format, with `file_size` as the
/// header's `<file_size>` value (the device length, in blocks, that the
/// extents are relative to).
pub fn write_extents(path: &Path, file_size: u64, extents: &ExtentVector) -> Result<()> {
    let file = std::fs::File::create(path).map_err(|e| EngineError::io(e, format!("creating {}", path.display())))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "length {file_size}").map_err(|e| EngineError::io(e, "writing header"))?;
    writeln!(out, "physical\tlogical\tlength\tuser_data").map_err(|e| EngineError::io(e, "writing column header"))?;
    for e in extents.iter() {
        writeln!(out, "{}\t{}\t{}\t{}", e.physical, e.logical, e.length, tag_to_code(e.tag))
            .map_err(|err| EngineError::io(err, "writing extent line"))?;
    }
    out.flush().map_err(|e| EngineError::io(e, "flushing extent file"))?;
    Ok(())
}

/// Reload an extent file written by [`write_extents`]. Entries are merged
/// with [`ExtentVector::append_with_merge`] as they're read, mirroring the
/// original reload-then-merge flow. Returns the parsed `file_size` and the
/// reconstructed vector.
pub fn read_extents(path: &Path) -> Result<(u64, ExtentVector)> {
    let file = std::fs::File::open(path).map_err(|e| EngineError::io(e, format!("opening {}", path.display())))?;
    let mut lines = BufReader::new(file).lines();

    let header = lines
        .next()
        .ok_or_else(|| EngineError::new(ErrorKind::InvalidInput, "extent file is empty, missing header"))?
        .map_err(|e| EngineError::io(e, "reading header"))?;
    let file_size: u64 = header
        .strip_prefix("length ")
        .ok_or_else(|| EngineError::new(ErrorKind::InvalidInput, format!("malformed header line: {header:?}")))?
        .trim()
        .parse()
        .map_err(|_| EngineError::new(ErrorKind::InvalidInput, format!("non-numeric file size in header: {header:?}")))?;

    // column header line, discarded.
    lines
        .next()
        .ok_or_else(|| EngineError::new(ErrorKind::InvalidInput, "extent file is missing its column header"))?
        .map_err(|e| EngineError::io(e, "reading column header"))?;

    let mut vector = ExtentVector::new();
    for (lineno, line) in lines.enumerate() {
        let line = line.map_err(|e| EngineError::io(e, "reading extent line"))?;
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 4 {
            return Err(EngineError::new(
                ErrorKind::InvalidInput,
                format!("malformed extent line {} (want 4 tab-separated fields, got {})", lineno + 3, fields.len()),
            ));
        }
        let parse = |s: &str| -> Result<u64> {
            s.parse()
                .map_err(|_| EngineError::new(ErrorKind::InvalidInput, format!("non-numeric field {s:?} on line {}", lineno + 3)))
        };
        let physical = parse(fields[0])?;
        let logical = parse(fields[1])?;
        let length = parse(fields[2])?;
        let tag = code_to_tag(parse(fields[3])? as u8)?;
        vector.append_with_merge(Extent::new(physical, logical, length, tag));
    }

    Ok((file_size, vector))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_a_vector_through_the_wire_format() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut v = ExtentVector::new();
        v.push(Extent::new(0, 0, 4, Tag::LoopFile));
        v.push(Extent::new(10, 10, 2, Tag::Device));

        write_extents(tmp.path(), 100, &v).unwrap();
        let (file_size, reloaded) = read_extents(tmp.path()).unwrap();

        assert_eq!(file_size, 100);
        let got: Vec<_> = reloaded.iter().map(|e| (e.physical, e.logical, e.length, e.tag)).collect();
        assert_eq!(got, vec![(0, 0, 4, Tag::LoopFile), (10, 10, 2, Tag::Device)]);
    }

    #[test]
    fn rejects_a_file_with_the_wrong_field_count() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "length 10\nphysical\tlogical\tlength\tuser_data\n0\t0\n").unwrap();
        let err = read_extents(tmp.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn rejects_a_missing_header() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "").unwrap();
        let err = read_extents(tmp.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
