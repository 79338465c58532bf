//! Declarative route construction: filters, middleware, finalizers.

use std::panic::Location;
use std::sync::Arc;

use async_trait::async_trait;
use rudder_core::{FieldSelector, Kind, LabelSelector};

use crate::handler_set::HandlerSet;
use crate::request::{Handler, Request, Response};

pub type Middleware = Arc<dyn Fn(Arc<dyn Handler>) -> Arc<dyn Handler> + Send + Sync>;

/// Builds a handler chain for one kind.
///
/// Decoration order, innermost out: finalizer, user middleware (first
/// registered runs outermost), name/namespace filter, label selector, field
/// selector, deletion skipping, error prefix.
#[derive(Clone)]
pub struct RouteBuilder {
    set: Arc<HandlerSet>,
    kind: Option<Kind>,
    name: String,
    namespace: String,
    route_name: String,
    middleware: Vec<Middleware>,
    selector: Option<LabelSelector>,
    field_selector: Option<FieldSelector>,
    include_removed: bool,
    include_finalizing: bool,
    finalize_id: String,
}

/// Default route name: the registration site's `file.rs:line`.
pub(crate) fn caller_name(location: &Location<'_>) -> String {
    let file = location.file().rsplit(['/', '\\']).next().unwrap_or(location.file());
    format!("{}:{}", file, location.line())
}

impl RouteBuilder {
    pub(crate) fn new(set: Arc<HandlerSet>) -> Self {
        Self {
            set,
            kind: None,
            name: String::new(),
            namespace: String::new(),
            route_name: String::new(),
            middleware: Vec::new(),
            selector: None,
            field_selector: None,
            include_removed: false,
            include_finalizing: false,
            finalize_id: String::new(),
        }
    }

    pub fn kind(mut self, kind: Kind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn route_name(mut self, route_name: impl Into<String>) -> Self {
        self.route_name = route_name.into();
        self
    }

    pub fn middleware(mut self, mw: Middleware) -> Self {
        self.middleware.push(mw);
        self
    }

    pub fn selector(mut self, selector: LabelSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn field_selector(mut self, selector: FieldSelector) -> Self {
        self.field_selector = Some(selector);
        self
    }

    /// Also dispatch deleted objects (object is None).
    pub fn include_removed(mut self) -> Self {
        self.include_removed = true;
        self
    }

    /// Also dispatch objects with a deletion timestamp set.
    pub fn include_finalizing(mut self) -> Self {
        self.include_finalizing = true;
        self
    }

    /// Registers `handler` to run at finalization time, guarded by
    /// `finalizer_id` on the object.
    #[track_caller]
    pub fn finalize(mut self, finalizer_id: impl Into<String>, handler: Arc<dyn Handler>) {
        self.finalize_id = finalizer_id.into();
        if self.route_name.is_empty() {
            self.route_name = caller_name(Location::caller());
        }
        self.handler(handler);
    }

    #[track_caller]
    pub fn handler(self, handler: Arc<dyn Handler>) {
        let kind = match &self.kind {
            Some(k) => k.clone(),
            None => panic!("route registered without a kind"),
        };
        let route_name = if self.route_name.is_empty() {
            caller_name(Location::caller())
        } else {
            self.route_name.clone()
        };

        let mut result = handler;
        if !self.finalize_id.is_empty() {
            result = Arc::new(FinalizerHandler {
                finalizer_id: self.finalize_id.clone(),
                next: result,
            });
        }
        for mw in self.middleware.iter().rev() {
            result = mw(result);
        }
        if !self.name.is_empty() || !self.namespace.is_empty() {
            result = Arc::new(NameNamespaceFilter {
                next: result,
                name: self.name.clone(),
                namespace: self.namespace.clone(),
            });
        }
        if let Some(selector) = self.selector.clone() {
            result = Arc::new(SelectorFilter { next: result, selector });
        }
        if let Some(fields) = self.field_selector.clone() {
            result = Arc::new(FieldSelectorFilter { next: result, fields });
        }
        if self.include_finalizing && !self.include_removed && self.finalize_id.is_empty() {
            result = Arc::new(IgnoreNilHandler { next: result });
        }
        if !self.include_removed && !self.include_finalizing && self.finalize_id.is_empty() {
            result = Arc::new(IgnoreRemoveHandler { next: result });
        }
        result = Arc::new(ErrorPrefix {
            prefix: format!("[{route_name}]"),
            next: result,
        });

        self.set.add_handler(&route_name, &kind, result);
    }
}

/// Skips deleted objects.
struct IgnoreNilHandler {
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for IgnoreNilHandler {
    async fn handle(&self, req: &mut Request, resp: &mut Response) -> anyhow::Result<()> {
        if req.object.is_none() {
            return Ok(());
        }
        self.next.handle(req, resp).await
    }
}

/// Skips deleted objects and objects that are being finalized.
struct IgnoreRemoveHandler {
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for IgnoreRemoveHandler {
    async fn handle(&self, req: &mut Request, resp: &mut Response) -> anyhow::Result<()> {
        match &req.object {
            None => Ok(()),
            Some(obj) if obj.is_deleting() => Ok(()),
            Some(_) => self.next.handle(req, resp).await,
        }
    }
}

struct NameNamespaceFilter {
    next: Arc<dyn Handler>,
    name: String,
    namespace: String,
}

#[async_trait]
impl Handler for NameNamespaceFilter {
    async fn handle(&self, req: &mut Request, resp: &mut Response) -> anyhow::Result<()> {
        if !self.name.is_empty() && req.name != self.name {
            return Ok(());
        }
        if !self.namespace.is_empty() && req.namespace != self.namespace {
            return Ok(());
        }
        self.next.handle(req, resp).await
    }
}

struct SelectorFilter {
    next: Arc<dyn Handler>,
    selector: LabelSelector,
}

#[async_trait]
impl Handler for SelectorFilter {
    async fn handle(&self, req: &mut Request, resp: &mut Response) -> anyhow::Result<()> {
        match &req.object {
            Some(obj) if self.selector.matches(&obj.meta.labels) => {
                self.next.handle(req, resp).await
            }
            _ => Ok(()),
        }
    }
}

struct FieldSelectorFilter {
    next: Arc<dyn Handler>,
    fields: FieldSelector,
}

#[async_trait]
impl Handler for FieldSelectorFilter {
    async fn handle(&self, req: &mut Request, resp: &mut Response) -> anyhow::Result<()> {
        match &req.object {
            Some(obj) if self.fields.matches(obj) => self.next.handle(req, resp).await,
            _ => Ok(()),
        }
    }
}

struct ErrorPrefix {
    prefix: String,
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for ErrorPrefix {
    async fn handle(&self, req: &mut Request, resp: &mut Response) -> anyhow::Result<()> {
        self.next
            .handle(req, resp)
            .await
            .map_err(|err| err.context(self.prefix.clone()))
    }
}

/// While the object is live, makes sure the finalizer id is set (the save
/// step persists the addition) and holds the inner handler back. Once the
/// object is deleting, runs the inner handler and clears the finalizer on
/// success.
struct FinalizerHandler {
    finalizer_id: String,
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for FinalizerHandler {
    async fn handle(&self, req: &mut Request, resp: &mut Response) -> anyhow::Result<()> {
        {
            let Some(obj) = req.object.as_mut() else {
                return Ok(());
            };
            if !obj.is_deleting() {
                obj.add_finalizer(&self.finalizer_id);
                return Ok(());
            }
            if !obj.has_finalizer(&self.finalizer_id) {
                return Ok(());
            }
        }
        self.next.handle(req, resp).await?;
        if let Some(obj) = req.object.as_mut() {
            obj.remove_finalizer(&self.finalizer_id);
        }
        Ok(())
    }
}
