use crate::iterator::Iter;

/// Factory producing a data iterator from an index entry's value (an
/// encoded handle of some kind). Failures yield an invalid iterator; the
/// caller treats the region as empty.
pub type BlockIterBuilder = Box<dyn Fn(&[u8]) -> Box<dyn Iter>>;

/// Iterates an index iterator and, through it, the data iterators its
/// values describe. Used both for table reads (index block over data
/// blocks) and for whole sorted levels (file list over tables).
pub struct TwoLevelIterator {
    index: Box<dyn Iter>,
    make_data: BlockIterBuilder,
    data: Option<Box<dyn Iter>>,
    /// Index value the current data iterator was built from; avoids
    /// rebuilding when the index has not moved.
    data_handle: Vec<u8>,
}

impl TwoLevelIterator {
    pub fn new(index: Box<dyn Iter>, make_data: BlockIterBuilder) -> TwoLevelIterator {
        TwoLevelIterator {
            index,
            make_data,
            data: None,
            data_handle: Vec::new(),
        }
    }

    fn init_data_iter(&mut self) {
        if !self.index.valid() {
            self.data = None;
            self.data_handle.clear();
            return;
        }
        let handle = self.index.value();
        if self.data.is_some() && self.data_handle == handle {
            return;
        }
        self.data_handle = handle.to_vec();
        self.data = Some((self.make_data)(handle));
    }

    fn skip_empty_data_forward(&mut self) {
        while self.data.as_ref().map_or(true, |d| !d.valid()) {
            if !self.index.valid() {
                self.data = None;
                return;
            }
            self.index.next();
            self.init_data_iter();
            if let Some(data) = &mut self.data {
                data.seek_to_first();
            }
        }
    }

    fn skip_empty_data_backward(&mut self) {
        while self.data.as_ref().map_or(true, |d| !d.valid()) {
            if !self.index.valid() {
                self.data = None;
                return;
            }
            self.index.prev();
            self.init_data_iter();
            if let Some(data) = &mut self.data {
                data.seek_to_last();
            }
        }
    }
}

impl Iter for TwoLevelIterator {
    fn valid(&self) -> bool {
        self.data.as_ref().is_some_and(|d| d.valid())
    }

    fn key(&self) -> &[u8] {
        self.data.as_ref().expect("valid").key()
    }

    fn value(&self) -> &[u8] {
        self.data.as_ref().expect("valid").value()
    }

    fn next(&mut self) {
        if !self.valid() {
            return;
        }
        self.data.as_mut().expect("valid").next();
        self.skip_empty_data_forward();
    }

    fn prev(&mut self) {
        if !self.valid() {
            return;
        }
        self.data.as_mut().expect("valid").prev();
        self.skip_empty_data_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index.seek(target);
        self.init_data_iter();
        if let Some(data) = &mut self.data {
            data.seek(target);
        }
        self.skip_empty_data_forward();
    }

    fn seek_to_first(&mut self) {
        self.index.seek_to_first();
        self.init_data_iter();
        if let Some(data) = &mut self.data {
            data.seek_to_first();
        }
        self.skip_empty_data_forward();
    }

    fn seek_to_last(&mut self) {
        self.index.seek_to_last();
        self.init_data_iter();
        if let Some(data) = &mut self.data {
            data.seek_to_last();
        }
        self.skip_empty_data_backward();
    }
}
