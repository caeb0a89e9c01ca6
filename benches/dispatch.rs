use brrtserver::config::ServerConfig;
use brrtserver::filter::{filter_fn, RootFilterList};
use brrtserver::handler::handler_fn;
use brrtserver::pool::Recycle;
use brrtserver::router::{FilterSet, PathVars, RouteResolver, Router};
use brrtserver::server::{Incoming, ResponseWriter, Server};
use criterion::{criterion_group, criterion_main, Criterion};
use http::Method;
use std::hint::black_box;
use std::io::Cursor;
use std::sync::Arc;

fn zoo_router() -> Router {
    let mut router = Router::new();
    router
        .get("/", handler_fn(|_req, resp| resp.write_str("root")))
        .get("/zoo/animals", handler_fn(|_req, resp| resp.write_str("[]")))
        .post("/zoo/animals", handler_fn(|_req, resp| resp.write_str("{}")))
        .get(
            "/zoo/animals/{id}",
            handler_fn(|req, resp| {
                let id = req.var("id").unwrap_or_default().to_string();
                resp.write_str(&id);
            }),
        )
        .get(
            "/zoo/animals/{id}/toys/{toy_id}",
            handler_fn(|_req, resp| resp.write_str("toy")),
        )
        .get(
            "/zoo/{category}/animals/{id}/habitats/{habitat_id}/sections/{section_id}",
            handler_fn(|_req, resp| resp.write_str("section")),
        )
        .post(
            "/inventory/{warehouse_id}/feeds/{feed_id}/items/{item_id}/batches/{batch_id}",
            handler_fn(|_req, resp| resp.write_str("batch")),
        )
        .get(
            "/complex/{a}/{b}/{c}/{d}/{e}/{f}/{g}/{h}/{i}",
            handler_fn(|_req, resp| resp.write_str("complex")),
        )
        .filter(
            "/zoo",
            filter_fn(|req, resp, chain| {
                chain.proceed(req, resp);
                resp.set_header("x-zoo", "1");
            }),
        );
    router
}

const TEST_PATHS: [(Method, &str); 5] = [
    (Method::GET, "/zoo/animals/123"),
    (Method::GET, "/zoo/animals/123/toys/456"),
    (Method::GET, "/zoo/cats/animals/123/habitats/88/sections/5"),
    (Method::POST, "/inventory/1/feeds/2/items/3/batches/4"),
    (Method::GET, "/complex/1/2/3/4/5/6/7/8/9"),
];

fn bench_route_resolve(c: &mut Criterion) {
    let router = zoo_router();
    let mut vars = PathVars::with_capacity(9);
    let mut filters = FilterSet::with_capacity(2);
    c.bench_function("route_resolve", |b| {
        b.iter(|| {
            for (_, path) in &TEST_PATHS {
                vars.recycle();
                filters.clear();
                let res = router.resolve(path, &mut vars, &mut filters);
                black_box(&res);
            }
        })
    });
}

fn bench_dispatch(c: &mut Criterion) {
    let mut root = RootFilterList::new();
    root.add(filter_fn(|req, resp, chain| chain.proceed(req, resp)));
    let server: Arc<Server> = Server::builder().router(zoo_router()).root_filters(root).build();
    server
        .configure(ServerConfig::default())
        .expect("configure server");

    let mut out = Cursor::new(Vec::with_capacity(4096));
    c.bench_function("dispatch", |b| {
        b.iter(|| {
            for (method, path) in &TEST_PATHS {
                out.get_mut().clear();
                out.set_position(0);
                let mut writer = ResponseWriter::new(&mut out, true);
                server.dispatch(Incoming::new(method.clone(), path), &mut writer);
            }
            black_box(out.get_ref().len());
        })
    });
}

criterion_group!(benches, bench_route_resolve, bench_dispatch);
criterion_main!(benches);
