use std::fmt;

use crate::error::MigrateError;

/// Destination location derived from a colon-delimited source page id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PagePath {
    pub container: String,
    pub subcontainer: Option<String>,
    pub leaf: String,
}

impl PagePath {
    pub fn new(container: &str, subcontainer: Option<&str>, leaf: &str) -> Self {
        Self {
            container: container.to_string(),
            subcontainer: subcontainer.map(ToString::to_string),
            leaf: leaf.to_string(),
        }
    }

    /// Ledger key of the subcontainer, `container/subcontainer`.
    pub fn subcontainer_key(&self) -> Option<String> {
        self.subcontainer
            .as_ref()
            .map(|subcontainer| format!("{}/{}", self.container, subcontainer))
    }
}

impl fmt::Display for PagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.container)?;
        if let Some(subcontainer) = &self.subcontainer {
            write!(f, "{subcontainer}/")?;
        }
        f.write_str(&self.leaf)
    }
}

pub fn map_page_id(page_id: &str) -> Result<PagePath, MigrateError> {
    if page_id.is_empty() {
        return Err(MigrateError::InvalidIdentifier(page_id.to_string()));
    }
    let segments = page_id.split(':').collect::<Vec<_>>();
    let path = match segments.as_slice() {
        [leaf] => PagePath::new(leaf, None, leaf),
        [container, leaf] => PagePath::new(container, None, leaf),
        [container, subcontainer, rest @ ..] => {
            PagePath::new(container, Some(subcontainer), &rest.join("-"))
        }
        [] => return Err(MigrateError::InvalidIdentifier(page_id.to_string())),
    };
    Ok(path)
}

/// Slash-separated path used by path-addressed destinations.
pub fn flat_path(page_id: &str) -> String {
    page_id.replace(':', "/")
}

pub fn leaf_title(page_id: &str) -> String {
    title_case(page_id.rsplit(':').next().unwrap_or(page_id))
}

/// Upper-cases the first letter of every alphabetic run and lower-cases the rest.
pub fn title_case(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut previous_is_alpha = false;
    for ch in value.chars() {
        if ch.is_alphabetic() {
            if previous_is_alpha {
                output.extend(ch.to_lowercase());
            } else {
                output.extend(ch.to_uppercase());
            }
            previous_is_alpha = true;
        } else {
            output.push(ch);
            previous_is_alpha = false;
        }
    }
    output
}
