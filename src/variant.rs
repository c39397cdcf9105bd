//! Selection of the variant (character, skin) sent with a match request.

/// A wrapping carousel over the variants the local participant owns.
///
/// An empty carousel is inert: navigation does nothing and
/// [`selected`](Self::selected) returns `None`.
///
/// # Example
///
/// ```
/// use matchlink_client::VariantCarousel;
///
/// let mut carousel = VariantCarousel::new(vec![4, 9, 12]);
/// assert_eq!(carousel.selected(), Some(4));
/// carousel.select_previous();
/// assert_eq!(carousel.selected(), Some(12));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantCarousel {
    owned: Vec<u32>,
    index: usize,
}

impl VariantCarousel {
    /// Create a carousel positioned on the first owned variant.
    pub fn new(owned: Vec<u32>) -> Self {
        Self { owned, index: 0 }
    }

    /// Currently selected variant.
    pub fn selected(&self) -> Option<u32> {
        self.owned.get(self.index).copied()
    }

    /// Move to the next variant, wrapping to the first.
    pub fn select_next(&mut self) -> Option<u32> {
        if !self.owned.is_empty() {
            self.index = (self.index + 1) % self.owned.len();
        }
        self.selected()
    }

    /// Move to the previous variant, wrapping to the last.
    pub fn select_previous(&mut self) -> Option<u32> {
        if !self.owned.is_empty() {
            self.index = self
                .index
                .checked_sub(1)
                .unwrap_or(self.owned.len() - 1);
        }
        self.selected()
    }

    /// Select `variant` if it is owned. Returns whether the selection changed.
    pub fn select(&mut self, variant: u32) -> bool {
        match self.owned.iter().position(|&v| v == variant) {
            Some(index) if index != self.index => {
                self.index = index;
                true
            }
            _ => false,
        }
    }

    /// Number of owned variants.
    pub fn len(&self) -> usize {
        self.owned.len()
    }

    /// Returns `true` if no variant is owned.
    pub fn is_empty(&self) -> bool {
        self.owned.is_empty()
    }
}
