// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! String-keyed table of adaptor constructors.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::adaptor::const_rate::ConstRateAdaptor;
use crate::adaptor::exec::ExecAdaptor;
use crate::adaptor::file_tailer::FileTailerAdaptor;
use crate::adaptor::mem_buffered::{MemBufferStore, MemBuffered};
use crate::adaptor::udp::UdpAdaptor;
use crate::adaptor::writeahead::WriteaheadBuffered;
use crate::adaptor::Adaptor;
use crate::config::AdaptorSettings;

pub type AdaptorConstructor = Arc<dyn Fn() -> Box<dyn Adaptor> + Send + Sync>;

#[derive(Clone, Default)]
pub struct AdaptorFactory {
    constructors: HashMap<String, AdaptorConstructor>,
}

impl AdaptorFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory knowing every adaptor shipped with the agent.
    #[must_use]
    pub fn with_builtins(settings: &AdaptorSettings, mem_buffers: Arc<MemBufferStore>) -> Self {
        let mut factory = Self::new();

        let s = settings.clone();
        factory.register("ConstRate", move || Box::new(ConstRateAdaptor::new(&s)));
        let s = settings.clone();
        factory.register("FileTailer", move || Box::new(FileTailerAdaptor::new(&s)));
        let s = settings.clone();
        factory.register("Exec", move || Box::new(ExecAdaptor::new(&s)));
        let s = settings.clone();
        factory.register("Udp", move || Box::new(UdpAdaptor::new(&s)));
        let s = settings.clone();
        factory.register("MemBuffered", move || {
            Box::new(MemBuffered::new(&s, Arc::clone(&mem_buffers)))
        });
        let s = settings.clone();
        factory.register("WriteaheadBuffered", move || {
            Box::new(WriteaheadBuffered::new(&s))
        });

        factory
    }

    pub fn register<F>(&mut self, class: &str, constructor: F)
    where
        F: Fn() -> Box<dyn Adaptor> + Send + Sync + 'static,
    {
        self.constructors
            .insert(class.to_string(), Arc::new(constructor));
    }

    /// Registered name for `class`. A dotted name such as
    /// `harvest.adaptor.FileTailer` falls back to its last segment.
    #[must_use]
    pub fn resolve<'a>(&self, class: &'a str) -> Option<&'a str> {
        if self.constructors.contains_key(class) {
            return Some(class);
        }
        class
            .rsplit_once('.')
            .map(|(_, short)| short)
            .filter(|short| self.constructors.contains_key(*short))
    }

    /// Creates an adaptor by class name, resolved as in [`AdaptorFactory::resolve`].
    #[must_use]
    pub fn create(&self, class: &str) -> Option<Box<dyn Adaptor>> {
        let constructor = self.constructors.get(self.resolve(class)?)?;
        Some(constructor())
    }

    #[must_use]
    pub fn classes(&self) -> Vec<&str> {
        let mut classes: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        classes.sort_unstable();
        classes
    }
}

impl fmt::Debug for AdaptorFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptorFactory")
            .field("classes", &self.classes())
            .finish()
    }
}
