// category.rs

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// The six material categories. Declaration order is the label order used by
/// the loader, the model head and the predictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Cardboard,
    Glass,
    Metal,
    Paper,
    Plastic,
    Trash,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Cardboard,
        Category::Glass,
        Category::Metal,
        Category::Paper,
        Category::Plastic,
        Category::Trash,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> i64 {
        self as i64
    }

    pub fn from_index(index: usize) -> Result<Self> {
        Self::ALL
            .get(index)
            .copied()
            .ok_or(Error::LabelOutOfRange(index as i64))
    }

    pub fn from_label(label: i64) -> Result<Self> {
        usize::try_from(label)
            .map_err(|_| Error::LabelOutOfRange(label))
            .and_then(|i| Self::from_index(i).map_err(|_| Error::LabelOutOfRange(label)))
    }

    /// Directory and display name.
    pub fn name(self) -> &'static str {
        match self {
            Category::Cardboard => "cardboard",
            Category::Glass => "glass",
            Category::Metal => "metal",
            Category::Paper => "paper",
            Category::Plastic => "plastic",
            Category::Trash => "trash",
        }
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|c| c.name()).collect()
    }

    /// Short bin guidance shown next to a prediction.
    pub fn disposal_hint(self) -> &'static str {
        match self {
            Category::Cardboard => "Flatten boxes and keep them dry before recycling.",
            Category::Glass => "Rinse bottles and jars; remove lids.",
            Category::Metal => "Empty and rinse cans; aluminium and steel both recycle.",
            Category::Paper => "Recycle clean paper; greasy or wet paper goes to compost.",
            Category::Plastic => "Check the resin code; rinse containers before recycling.",
            Category::Trash => "Not recyclable: general waste bin.",
        }
    }

    /// Fails unless `count` equals the fixed category count.
    pub fn ensure_count(count: usize) -> Result<()> {
        if count == Self::COUNT {
            Ok(())
        } else {
            Err(Error::CategoryCount {
                expected: Self::COUNT,
                found: count,
            })
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::UnknownCategory(s.to_string()))
    }
}
