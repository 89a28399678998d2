// Presentation seam
//
// The frame ring does not own a window. Whatever shows the images implements
// `Presenter`; a swapchain-backed one would map out-of-date results to
// `None`/`false` and rebuild on request.

use crate::error::Result;
use ash::vk;

/// An image handed out by `acquire`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    /// Whether the presenter signals `image_available` and waits on
    /// `render_finished`. When false the frame must not touch either.
    pub synchronized: bool,
}

pub trait Presenter {
    /// False once the surface no longer matches (resize, lost swapchain).
    fn is_valid(&self) -> bool;

    /// Mark the surface stale; the next `end_frame` rebuilds it.
    fn invalidate(&mut self);

    fn rebuild(&mut self) -> Result<()>;

    /// Next image to render into, or `None` if the surface went out of date.
    fn acquire(&mut self, image_available: vk::Semaphore) -> Result<Option<AcquiredImage>>;

    /// Queue `image` for display. Returns false if the surface went out of
    /// date while presenting.
    fn present(&mut self, image: AcquiredImage, render_finished: vk::Semaphore) -> Result<bool>;
}

/// Presents into nothing: cycles `image_count` virtual images with no GPU sync.
#[derive(Debug)]
pub struct OffscreenPresenter {
    image_count: u32,
    next_image: u32,
    valid: bool,
    presented: u64,
    rebuilds: u64,
}

impl OffscreenPresenter {
    pub fn new(image_count: u32) -> Self {
        Self {
            image_count: image_count.max(1),
            next_image: 0,
            valid: true,
            presented: 0,
            rebuilds: 0,
        }
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }
}

impl Presenter for OffscreenPresenter {
    fn is_valid(&self) -> bool {
        self.valid
    }

    fn invalidate(&mut self) {
        self.valid = false;
    }

    fn rebuild(&mut self) -> Result<()> {
        self.valid = true;
        self.next_image = 0;
        self.rebuilds += 1;
        log::info!("Rebuilt offscreen surface ({} images)", self.image_count);
        Ok(())
    }

    fn acquire(&mut self, _image_available: vk::Semaphore) -> Result<Option<AcquiredImage>> {
        if !self.valid {
            return Ok(None);
        }
        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count;
        Ok(Some(AcquiredImage {
            index,
            synchronized: false,
        }))
    }

    fn present(&mut self, image: AcquiredImage, _render_finished: vk::Semaphore) -> Result<bool> {
        if !self.valid {
            return Ok(false);
        }
        self.presented += 1;
        log::trace!("Presented offscreen image {}", image.index);
        Ok(true)
    }
}
