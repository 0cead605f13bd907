use http::{Method, Request};
use monoio_pipeline::{FullResponse, PipeliningRequester, RequestBody};

fn get(path: &str) -> Request<RequestBody> {
    Request::builder()
        .method(Method::GET)
        .uri(format!("http://httpbin.org{path}"))
        .body(RequestBody::None)
        .unwrap()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let requester = PipeliningRequester::builder().build()?;

    let handle = requester.execute_pipelined(
        vec![get("/get"), get("/headers"), get("/user-agent")],
        vec![FullResponse, FullResponse, FullResponse],
    );
    for (i, response) in handle.wait().into_result()?.into_iter().enumerate() {
        println!("response {} status {}", i + 1, response.status());
        println!("{}", String::from_utf8_lossy(response.body()));
    }

    let status = requester.shutdown()?;
    println!("shutdown: {status:?}");
    Ok(())
}
